use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};

use murmur_types::models::DEFAULT_MAX_MEMBERS;

/// Process configuration, read from `MURMUR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub push_webhook_url: Option<String>,
    pub heartbeat: Duration,
    pub stale_after: Duration,
    pub reap_interval: Duration,
    pub max_message_len: usize,
    pub default_max_members: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            jwt_secret: text("MURMUR_JWT_SECRET", "dev-secret-change-me"),
            db_path: PathBuf::from(text("MURMUR_DB_PATH", "murmur.db")),
            host: text("MURMUR_HOST", "0.0.0.0"),
            port: number(&get, "MURMUR_PORT", 3000)?,
            push_webhook_url: get("MURMUR_PUSH_WEBHOOK_URL").filter(|url| !url.trim().is_empty()),
            heartbeat: seconds(&get, "MURMUR_HEARTBEAT_SECS", 15)?,
            stale_after: seconds(&get, "MURMUR_STALE_AFTER_SECS", 90)?,
            reap_interval: seconds(&get, "MURMUR_REAP_INTERVAL_SECS", 30)?,
            max_message_len: number(&get, "MURMUR_MAX_MESSAGE_LEN", 4000)?,
            default_max_members: number(&get, "MURMUR_DEFAULT_MAX_MEMBERS", DEFAULT_MAX_MEMBERS)?,
        };

        // Otherwise every live connection would be reaped between pings.
        ensure!(
            config.stale_after > config.heartbeat,
            "MURMUR_STALE_AFTER_SECS ({}s) must exceed MURMUR_HEARTBEAT_SECS ({}s)",
            config.stale_after.as_secs(),
            config.heartbeat.as_secs()
        );
        Ok(config)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn number<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

/// A whole number of seconds, at least one.
fn seconds(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = number(get, key, default)?;
    if secs == 0 {
        bail!("{} must be at least 1 second", key);
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.jwt_secret, "dev-secret-change-me");
        assert_eq!(cfg.db_path, PathBuf::from("murmur.db"));
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.heartbeat, Duration::from_secs(15));
        assert_eq!(cfg.stale_after, Duration::from_secs(90));
        assert_eq!(cfg.reap_interval, Duration::from_secs(30));
        assert_eq!(cfg.max_message_len, 4000);
        assert_eq!(cfg.default_max_members, 256);
        assert!(cfg.push_webhook_url.is_none());
        assert_eq!(cfg.addr().unwrap().port(), 3000);
    }

    #[test]
    fn overrides_are_read() {
        let cfg = config(&[
            ("MURMUR_PORT", "8088"),
            ("MURMUR_HOST", "127.0.0.1"),
            ("MURMUR_PUSH_WEBHOOK_URL", "http://push.local/send"),
            ("MURMUR_DEFAULT_MAX_MEMBERS", " 12 "),
        ])
        .unwrap();
        assert_eq!(cfg.addr().unwrap().to_string(), "127.0.0.1:8088");
        assert_eq!(cfg.push_webhook_url.as_deref(), Some("http://push.local/send"));
        assert_eq!(cfg.default_max_members, 12);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = config(&[("MURMUR_HEARTBEAT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("MURMUR_HEARTBEAT_SECS"));
    }

    #[test]
    fn blank_webhook_means_none() {
        let cfg = config(&[("MURMUR_PUSH_WEBHOOK_URL", "  ")]).unwrap();
        assert!(cfg.push_webhook_url.is_none());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in ["MURMUR_HEARTBEAT_SECS", "MURMUR_REAP_INTERVAL_SECS", "MURMUR_STALE_AFTER_SECS"] {
            let err = config(&[(key, "0")]).unwrap_err();
            assert!(err.to_string().contains(key), "{}: {}", key, err);
        }
    }

    #[test]
    fn stale_window_must_outlast_the_heartbeat() {
        let err = config(&[("MURMUR_HEARTBEAT_SECS", "30"), ("MURMUR_STALE_AFTER_SECS", "30")]).unwrap_err();
        assert!(err.to_string().contains("MURMUR_STALE_AFTER_SECS"));

        let cfg = config(&[("MURMUR_HEARTBEAT_SECS", "5"), ("MURMUR_STALE_AFTER_SECS", "12")]).unwrap();
        assert_eq!(cfg.stale_after, Duration::from_secs(12));
    }
}
