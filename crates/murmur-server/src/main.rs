use std::sync::Arc;

use tracing::info;

use murmur_core::{ChatServices, CoreConfig, LogNotifier, Notifier, WebhookNotifier};
use murmur_gateway::GatewayConfig;
use murmur_server::build_app;
use murmur_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(murmur_db::Database::open(&config.db_path)?);

    let notifier: Arc<dyn Notifier> = match &config.push_webhook_url {
        Some(url) => {
            info!("Push notifications go to {}", url);
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => {
            info!("No push gateway configured, push notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let services = ChatServices::new(
        db,
        notifier,
        CoreConfig {
            max_message_len: config.max_message_len,
            default_max_members: config.default_max_members,
        },
    );

    // Reaper for connections whose heartbeats stopped without a close
    let presence = services.presence.clone();
    let (stale_after, reap_interval) = (config.stale_after, config.reap_interval);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(reap_interval);
        loop {
            tick.tick().await;
            let reaped = presence.reap(stale_after).await;
            if reaped > 0 {
                info!("Reaper marked {} users offline", reaped);
            }
        }
    });

    let app = build_app(
        services,
        GatewayConfig {
            heartbeat: config.heartbeat,
            ..GatewayConfig::new(config.jwt_secret.clone())
        },
    );

    let addr = config.addr()?;
    info!("Murmur server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
