//! Realtime notification bus.
//!
//! Tracks which live connections watch which sessions and fans change
//! events out to them. Per-process state only: it is rebuilt from scratch
//! as clients reconnect and is never a source of truth.

use dashmap::DashMap;
use std::collections::HashSet;
use teamflow::protocol::Event;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Server-assigned identifier of one client connection.
pub type ConnId = u64;

struct Connection {
    user_id: String,
    tx: mpsc::Sender<Event>,
    sessions: HashSet<String>,
}

/// Registry of session subscribers.
///
/// Never holds a lock on one map while touching the other.
#[derive(Default)]
pub struct RealtimeBus {
    sessions: DashMap<String, HashSet<ConnId>>,
    connections: DashMap<ConnId, Connection>,
}

impl RealtimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection and its outbound queue.
    /// Re-registering replaces the user and queue and keeps subscriptions.
    pub fn register(&self, conn: ConnId, user_id: &str, tx: mpsc::Sender<Event>) {
        let mut entry = self.connections.entry(conn).or_insert_with(|| Connection {
            user_id: user_id.to_string(),
            tx: tx.clone(),
            sessions: HashSet::new(),
        });
        entry.user_id = user_id.to_string();
        entry.tx = tx;
    }

    /// User bound to a registered connection.
    pub fn user_of(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).map(|c| c.user_id.clone())
    }

    /// Add `conn` to the session's subscriber set. Returns false if the
    /// connection is not registered.
    pub fn subscribe(&self, conn: ConnId, session_id: &str) -> bool {
        {
            let Some(mut entry) = self.connections.get_mut(&conn) else {
                return false;
            };
            entry.sessions.insert(session_id.to_string());
        }
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(conn);
        true
    }

    pub fn unsubscribe(&self, conn: ConnId, session_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(&conn) {
            entry.sessions.remove(session_id);
        }
        self.remove_from_session(session_id, conn);
    }

    fn remove_from_session(&self, session_id: &str, conn: ConnId) {
        if let Some(mut set) = self.sessions.get_mut(session_id) {
            set.remove(&conn);
        }
        self.sessions.remove_if(session_id, |_, set| set.is_empty());
    }

    fn subscribers(&self, session_id: &str) -> Vec<ConnId> {
        self.sessions
            .get(session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queue `event` for every subscriber of `session_id` without waiting.
    ///
    /// A full queue drops the event for that subscriber; it catches up on
    /// its next refetch. A closed queue means the connection is gone and it
    /// is unregistered. Returns the number of queues that accepted the event.
    pub fn broadcast(&self, session_id: &str, event: Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for conn in self.subscribers(session_id) {
            let Some(tx) = self.connections.get(&conn).map(|c| c.tx.clone()) else {
                closed.push(conn);
                continue;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(conn, session_id, "subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(conn),
            }
        }
        for conn in closed {
            tracing::debug!(conn, session_id, "dropping closed subscriber");
            self.disconnect(conn);
            // The connection may already be gone from `connections`.
            self.remove_from_session(session_id, conn);
        }
        delivered
    }

    /// Drop every subscription `user_id` holds on `session_id`.
    pub fn evict_user(&self, session_id: &str, user_id: &str) -> usize {
        let targets: Vec<ConnId> = self
            .subscribers(session_id)
            .into_iter()
            .filter(|conn| {
                self.connections
                    .get(conn)
                    .is_some_and(|c| c.user_id == user_id)
            })
            .collect();
        for conn in &targets {
            self.unsubscribe(*conn, session_id);
        }
        if !targets.is_empty() {
            tracing::info!(session_id, user_id, count = targets.len(), "evicted subscriber");
        }
        targets.len()
    }

    /// Forget a session entirely, e.g. after it was deleted.
    pub fn close_session(&self, session_id: &str) {
        let Some((_, conns)) = self.sessions.remove(session_id) else {
            return;
        };
        for conn in conns {
            if let Some(mut entry) = self.connections.get_mut(&conn) {
                entry.sessions.remove(session_id);
            }
        }
    }

    /// Remove a connection from every session it watched.
    pub fn disconnect(&self, conn: ConnId) {
        let Some((_, entry)) = self.connections.remove(&conn) else {
            return;
        };
        for session_id in &entry.sessions {
            self.remove_from_session(session_id, conn);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamflow::protocol::ChangeKind;

    fn event(session_id: &str) -> Event {
        Event::SessionChanged {
            session_id: session_id.to_string(),
            change: ChangeKind::Chat,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let bus = RealtimeBus::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        bus.register(1, "alice", tx1);
        bus.register(2, "bob", tx2);
        assert!(bus.subscribe(1, "s1"));
        assert!(bus.subscribe(2, "s2"));

        assert_eq!(bus.broadcast("s1", event("s1")), 1);
        assert_eq!(rx1.recv().await.unwrap(), event("s1"));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unregistered_connection_cannot_subscribe() {
        let bus = RealtimeBus::new();
        assert!(!bus.subscribe(9, "s1"));
        assert_eq!(bus.subscriber_count("s1"), 0);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let bus = RealtimeBus::new();
        let (tx, _rx) = mpsc::channel(1);
        bus.register(1, "alice", tx);
        bus.subscribe(1, "s1");
        assert_eq!(bus.broadcast("s1", event("s1")), 1);
        assert_eq!(bus.broadcast("s1", event("s1")), 0);
        // Still subscribed; only the event was lost.
        assert_eq!(bus.subscriber_count("s1"), 1);
    }

    #[test]
    fn closed_queue_is_unregistered() {
        let bus = RealtimeBus::new();
        let (tx, rx) = mpsc::channel(1);
        bus.register(1, "alice", tx);
        bus.subscribe(1, "s1");
        drop(rx);
        assert_eq!(bus.broadcast("s1", event("s1")), 0);
        assert_eq!(bus.subscriber_count("s1"), 0);
        assert_eq!(bus.connection_count(), 0);
    }

    #[test]
    fn orphaned_subscriber_is_pruned_on_broadcast() {
        let bus = RealtimeBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.register(1, "alice", tx);
        bus.subscribe(1, "s1");
        // A session entry left behind for a connection that is no longer registered.
        bus.sessions.entry("s1".to_string()).or_default().insert(7);
        assert_eq!(bus.subscriber_count("s1"), 2);

        assert_eq!(bus.broadcast("s1", event("s1")), 1);
        assert_eq!(rx.try_recv().unwrap(), event("s1"));
        assert_eq!(bus.subscriber_count("s1"), 1);
    }

    #[test]
    fn disconnect_clears_every_session() {
        let bus = RealtimeBus::new();
        let (tx, _rx) = mpsc::channel(4);
        bus.register(1, "alice", tx);
        bus.subscribe(1, "s1");
        bus.subscribe(1, "s2");
        bus.disconnect(1);
        assert_eq!(bus.session_count(), 0);
        assert_eq!(bus.connection_count(), 0);
    }

    #[test]
    fn evict_user_leaves_other_users() {
        let bus = RealtimeBus::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let (tx3, _rx3) = mpsc::channel(4);
        bus.register(1, "alice", tx1);
        bus.register(2, "bob", tx2);
        bus.register(3, "bob", tx3);
        for conn in [1, 2, 3] {
            bus.subscribe(conn, "s1");
        }
        bus.subscribe(2, "s2");

        assert_eq!(bus.evict_user("s1", "bob"), 2);
        assert_eq!(bus.subscriber_count("s1"), 1);
        assert_eq!(bus.subscriber_count("s2"), 1);
    }

    #[test]
    fn close_session_keeps_connections() {
        let bus = RealtimeBus::new();
        let (tx, _rx) = mpsc::channel(4);
        bus.register(1, "alice", tx);
        bus.subscribe(1, "s1");
        bus.close_session("s1");
        assert_eq!(bus.subscriber_count("s1"), 0);
        assert_eq!(bus.connection_count(), 1);
        assert_eq!(bus.user_of(1).as_deref(), Some("alice"));
    }
}
