use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use murmur_types::events::GatewayEvent;
use murmur_types::models::{ConnectionId, UserId};

/// Outbound half of a live connection. Dropping the registry entry drops the
/// sender, which ends the socket's write loop.
pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;

/// A presence flip. Only the first register and the last unregister of a
/// user produce one. `seq` orders flips process-wide; a flip is only
/// published while it is still the user's latest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub is_online: bool,
    pub at: DateTime<Utc>,
    pub seq: u64,
}

impl PresenceChange {
    pub fn to_event(&self) -> GatewayEvent {
        GatewayEvent::UserStatusChanged {
            user_id: self.user_id,
            is_online: self.is_online,
            last_seen_at: (!self.is_online).then_some(self.at),
        }
    }
}

/// Result of fanning one event out to a set of users.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Number of connections the event was queued on.
    pub delivered: usize,
    /// Users with no live connection at all.
    pub offline: Vec<UserId>,
}

struct ConnectionEntry {
    user_id: UserId,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    tx: EventSender,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    /// Seq of each user's latest flip; dropped once an offline flip is
    /// published.
    latest_flip: HashMap<UserId, u64>,
    next_seq: u64,
}

impl RegistryState {
    fn flip(&mut self, user_id: UserId, is_online: bool, at: DateTime<Utc>) -> PresenceChange {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.latest_flip.insert(user_id, seq);
        PresenceChange {
            user_id,
            is_online,
            at,
            seq,
        }
    }

    /// Drop `connection_id` from the user's set. Returns the offline flip if
    /// it was the user's last connection.
    fn detach(&mut self, user_id: UserId, connection_id: ConnectionId, at: DateTime<Utc>) -> Option<PresenceChange> {
        let conns = self.by_user.get_mut(&user_id)?;
        conns.remove(&connection_id);
        if !conns.is_empty() {
            return None;
        }

        self.by_user.remove(&user_id);
        Some(self.flip(user_id, false, at))
    }

    fn fan_out(&self, users: &[UserId], event: &GatewayEvent) -> FanOut {
        let mut seen = HashSet::new();
        let mut result = FanOut::default();

        for user_id in users.iter().copied().filter(|u| seen.insert(*u)) {
            match self.by_user.get(&user_id) {
                Some(conns) if !conns.is_empty() => {
                    for connection_id in conns {
                        if let Some(entry) = self.connections.get(connection_id) {
                            if entry.tx.send(event.clone()).is_ok() {
                                result.delivered += 1;
                            }
                        }
                    }
                }
                _ => result.offline.push(user_id),
            }
        }
        result
    }
}

/// Process-wide map of user -> live connections; the presence oracle.
///
/// One lock covers both indexes so a register and an unregister can never
/// leave them disagreeing. Constructed once per process and injected.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a connection. Re-registering an id under a
    /// different user moves it; the connected-at stamp is refreshed either way.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        tx: EventSender,
    ) -> Vec<PresenceChange> {
        let now = Utc::now();
        let mut state = self.inner.write().await;
        let mut changes = Vec::new();

        if let Some(previous) = state.connections.remove(&connection_id) {
            if previous.user_id != user_id {
                debug!(
                    "Connection {} moved from user {} to user {}",
                    connection_id, previous.user_id, user_id
                );
                changes.extend(state.detach(previous.user_id, connection_id, now));
            }
        }

        let conns = state.by_user.entry(user_id).or_default();
        let was_online = !conns.is_empty();
        conns.insert(connection_id);

        state.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                connected_at: now,
                last_heartbeat: Instant::now(),
                tx,
            },
        );
        if !was_online {
            changes.push(state.flip(user_id, true, now));
        }
        changes
    }

    /// Unknown ids are a no-op: disconnects can race with registry state.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<PresenceChange> {
        let mut state = self.inner.write().await;
        let entry = state.connections.remove(&connection_id)?;
        state.detach(entry.user_id, connection_id, Utc::now())
    }

    /// Refresh the heartbeat of a connection. Returns false if unknown.
    pub async fn touch(&self, connection_id: ConnectionId) -> bool {
        let mut state = self.inner.write().await;
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return false;
        };
        entry.last_heartbeat = Instant::now();
        true
    }

    /// Remove every connection whose last heartbeat is at least `max_age`
    /// old. Returns the resulting offline flips.
    pub async fn reap_stale(&self, max_age: Duration) -> Vec<PresenceChange> {
        let now = Utc::now();
        let mut state = self.inner.write().await;

        let stale: Vec<(ConnectionId, UserId)> = state
            .connections
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() >= max_age)
            .map(|(id, entry)| (*id, entry.user_id))
            .collect();

        let mut changes = Vec::new();
        for (connection_id, user_id) in stale {
            state.connections.remove(&connection_id);
            changes.extend(state.detach(user_id, connection_id, now));
            info!("Reaped stale connection {} of user {}", connection_id, user_id);
        }
        changes
    }

    pub async fn connections_of(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn owner_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|entry| entry.user_id)
    }

    pub async fn connected_at(&self, connection_id: ConnectionId) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|entry| entry.connected_at)
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .is_some_and(|conns| !conns.is_empty())
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.inner.read().await.by_user.keys().copied().collect()
    }

    /// Queue an event on one connection only.
    pub async fn send_to_connection(&self, connection_id: ConnectionId, event: GatewayEvent) -> bool {
        let state = self.inner.read().await;
        match state.connections.get(&connection_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue an event on every connection of one user. Returns how many took it.
    pub async fn send_to_user(&self, user_id: UserId, event: &GatewayEvent) -> usize {
        self.fan_out(&[user_id], event).await.delivered
    }

    /// Queue `event` on every live connection of every user in `users`.
    /// Duplicate user ids are delivered once.
    pub async fn fan_out(&self, users: &[UserId], event: &GatewayEvent) -> FanOut {
        self.inner.read().await.fan_out(users, event)
    }

    /// Queue a presence flip on the contacts' connections, unless a newer
    /// flip of the same user was recorded since. The check and the queueing
    /// happen under one lock, so contacts always end on the latest state.
    /// Returns false for a superseded flip.
    pub async fn publish_presence(&self, contacts: &[UserId], change: &PresenceChange) -> bool {
        let mut state = self.inner.write().await;
        if state.latest_flip.get(&change.user_id) != Some(&change.seq) {
            return false;
        }
        if !change.is_online {
            state.latest_flip.remove(&change.user_id);
        }
        state.fan_out(contacts, &change.to_event());
        true
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn channel() -> (EventSender, mpsc::UnboundedReceiver<GatewayEvent>) {
        mpsc::unbounded_channel()
    }

    fn typing() -> GatewayEvent {
        GatewayEvent::UserTyping {
            chat_id: Uuid::new_v4(),
            user_id: 1,
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn first_and_last_connection_flip_presence() {
        let registry = ConnectionRegistry::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        let changes = registry.register(1, c1, channel().0).await;
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_online);

        assert!(registry.register(1, c2, channel().0).await.is_empty());
        assert_eq!(registry.connections_of(1).await.len(), 2);

        assert!(registry.unregister(c1).await.is_none());
        assert!(registry.is_online(1).await);

        let last = registry.unregister(c2).await.unwrap();
        assert!(!last.is_online);
        assert!(!registry.is_online(1).await);
        assert!(registry.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn reregistering_under_another_user_moves_ownership() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();

        registry.register(1, conn, channel().0).await;
        let changes = registry.register(2, conn, channel().0).await;

        assert_eq!(registry.owner_of(conn).await, Some(2));
        assert!(!registry.is_online(1).await);
        assert!(registry.connections_of(1).await.is_empty());
        assert!(changes.iter().any(|c| c.user_id == 1 && !c.is_online));
        assert!(changes.iter().any(|c| c.user_id == 2 && c.is_online));
    }

    #[tokio::test]
    async fn reregistering_same_user_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();

        registry.register(1, conn, channel().0).await;
        let first = registry.connected_at(conn).await.unwrap();
        assert!(registry.register(1, conn, channel().0).await.is_empty());

        assert_eq!(registry.connections_of(1).await.len(), 1);
        assert!(registry.connected_at(conn).await.unwrap() >= first);
    }

    #[tokio::test]
    async fn unknown_unregister_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(Uuid::new_v4()).await.is_none());
        assert!(!registry.touch(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register(1, Uuid::new_v4(), tx_a).await;
        registry.register(1, Uuid::new_v4(), tx_b).await;

        let result = registry.fan_out(&[1, 1, 2], &typing()).await;
        assert_eq!(result.delivered, 2);
        assert_eq!(result.offline, vec![2]);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn reaping_removes_stale_entries_and_closes_their_channel() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = channel();
        registry.register(1, conn, tx).await;

        assert!(registry.reap_stale(Duration::from_secs(3600)).await.is_empty());

        let changes = registry.reap_stale(Duration::ZERO).await;
        assert_eq!(changes.len(), 1);
        assert!(!registry.is_online(1).await);
        // sender dropped with the entry
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn superseded_flips_are_not_published() {
        let registry = ConnectionRegistry::new();
        let (watcher, mut events) = channel();
        registry.register(2, Uuid::new_v4(), watcher).await;

        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        let online = registry.register(1, old, channel().0).await.remove(0);
        let offline = registry.unregister(old).await.unwrap();
        let back = registry.register(1, new, channel().0).await.remove(0);
        assert!(online.seq < offline.seq && offline.seq < back.seq);

        // published out of order: only the newest flip gets through
        assert!(registry.publish_presence(&[2], &back).await);
        assert!(!registry.publish_presence(&[2], &offline).await);
        assert!(!registry.publish_presence(&[2], &online).await);

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], GatewayEvent::UserStatusChanged { user_id: 1, is_online: true, .. }));
    }

    #[tokio::test]
    async fn published_offline_flip_forgets_the_user() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        registry.register(1, conn, channel().0).await;
        let offline = registry.unregister(conn).await.unwrap();

        assert!(registry.publish_presence(&[], &offline).await);
        assert!(registry.inner.read().await.latest_flip.is_empty());
        // a second publish of the same flip is stale
        assert!(!registry.publish_presence(&[], &offline).await);
    }
}
