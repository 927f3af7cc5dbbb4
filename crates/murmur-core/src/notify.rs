use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use murmur_types::models::UserId;

#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Push delivery for users with no live connection. Fire-and-forget:
/// implementations return immediately and log their own failures.
pub trait Notifier: Send + Sync {
    fn send_push(&self, notification: PushNotification);
}

/// Used when no push gateway is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_push(&self, notification: PushNotification) {
        debug!(
            "Push (not delivered, no gateway) to user {}: {}",
            notification.user_id, notification.title
        );
    }
}

/// POSTs each notification as JSON to an external push gateway.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn send_push(&self, notification: PushNotification) {
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let user_id = notification.user_id;
            match client.post(&url).json(&notification).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Push delivered for user {}", user_id);
                }
                Ok(resp) => {
                    warn!("Push gateway returned {} for user {}", resp.status(), user_id);
                }
                Err(e) => {
                    warn!("Push gateway unreachable for user {}: {}", user_id, e);
                }
            }
        });
    }
}
