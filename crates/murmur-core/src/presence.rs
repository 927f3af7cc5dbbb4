use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use murmur_types::events::GatewayEvent;
use murmur_types::models::{ConnectionId, UserId};

use crate::error::ChatResult;
use crate::registry::{ConnectionRegistry, EventSender, PresenceChange};
use crate::store::Store;

/// Connection lifecycle callbacks (`open`/`close`) invoked by the gateway,
/// plus the reaper entry point.
#[derive(Clone)]
pub struct Presence {
    store: Store,
    registry: ConnectionRegistry,
}

impl Presence {
    pub fn new(store: Store, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    /// Register a fresh connection, snapshot online contacts onto it, and
    /// announce the user if this was their first connection.
    pub async fn open(
        &self,
        user_id: UserId,
        username: &str,
        connection_id: ConnectionId,
        tx: EventSender,
    ) -> ChatResult<()> {
        let name = username.to_string();
        let now = Utc::now();
        self.store
            .call(move |db| {
                db.upsert_user(user_id, &name, None)?;
                db.touch_last_active(user_id, now)
            })
            .await?;

        let changes = self.registry.register(user_id, connection_id, tx).await;
        info!("User {} opened connection {}", user_id, connection_id);

        let contacts = self.store.call(move |db| db.contacts_of(user_id)).await?;
        let online = self.registry.online_users().await;
        for contact in contacts.iter().filter(|c| online.contains(c)) {
            let snapshot = GatewayEvent::UserStatusChanged {
                user_id: *contact,
                is_online: true,
                last_seen_at: None,
            };
            self.registry.send_to_connection(connection_id, snapshot).await;
        }

        for change in changes {
            self.announce(&change).await;
        }
        Ok(())
    }

    /// Unknown ids are ignored.
    pub async fn close(&self, connection_id: ConnectionId) {
        if let Some(change) = self.registry.unregister(connection_id).await {
            self.announce(&change).await;
        }
    }

    /// Drop connections that missed their heartbeats for `max_age`.
    /// Returns how many users went offline.
    pub async fn reap(&self, max_age: Duration) -> usize {
        let changes = self.registry.reap_stale(max_age).await;
        for change in &changes {
            self.announce(change).await;
        }
        changes.len()
    }

    /// Send a presence flip to everyone sharing an active chat with the
    /// user. Offline flips also persist the last-active stamp. A flip that a
    /// newer one overtook during the store round trips is dropped, so a
    /// racing close/open pair cannot leave contacts on the stale state.
    async fn announce(&self, change: &PresenceChange) {
        let user_id = change.user_id;

        if !change.is_online {
            let at = change.at;
            if let Err(e) = self
                .store
                .call(move |db| db.touch_last_active(user_id, at))
                .await
            {
                warn!("Failed to persist last active for user {}: {}", user_id, e);
            }
            info!("User {} went offline", user_id);
        }

        let contacts = match self.store.call(move |db| db.contacts_of(user_id)).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!("Could not resolve contacts of user {}: {}", user_id, e);
                Vec::new()
            }
        };
        if !self.registry.publish_presence(&contacts, change).await {
            debug!("Presence flip {} of user {} was superseded", change.seq, user_id);
        }
    }
}
