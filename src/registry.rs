//! Connection registry
//!
//! The set of live connection actors, keyed by connection ID. This is the
//! only long-lived shared mutable state in the gateway: register and
//! unregister take the write lock, broadcast and introspection take the read
//! lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::types::{ConnectionId, UserId};

/// Live connection actors
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly upgraded connection
    pub async fn register(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        info!(
            connection_id = %handle.id(),
            user_id = %handle.user_id(),
            "Connection registered"
        );
        connections.insert(handle.id(), handle);
        debug!("Total connections: {}", connections.len());
    }

    /// Remove a connection and signal its loops to stop
    ///
    /// Idempotent: only the first call for a given ID finds the entry and
    /// returns it; later calls return `None` and change nothing.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.write().await.remove(&id)?;
        removed.close();
        info!(
            connection_id = %id,
            user_id = %removed.user_id(),
            "Connection unregistered"
        );
        Some(removed)
    }

    /// Whether `id` is still registered
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live connections authenticated as `user_id`
    pub async fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .await
            .values()
            .filter(|h| h.user_id() == user_id)
            .cloned()
            .collect()
    }

    /// Copy out the handles whose user is in `users`
    ///
    /// The read lock is held only for the copy; callers enqueue after it has
    /// been released.
    pub async fn snapshot_matching(&self, users: &HashSet<&UserId>) -> Vec<ConnectionHandle> {
        if users.is_empty() {
            return Vec::new();
        }
        self.connections
            .read()
            .await
            .values()
            .filter(|h| users.contains(h.user_id()))
            .cloned()
            .collect()
    }

    /// Signal every registered connection to close
    ///
    /// Each actor's loops observe the signal, close their socket and
    /// unregister themselves. Returns how many connections were signalled.
    pub async fn close_all(&self) -> usize {
        let connections = self.connections.read().await;
        for handle in connections.values() {
            handle.close();
        }
        info!("Closing {} connections", connections.len());
        connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user: &str) -> ConnectionHandle {
        let (handle, _rx) = ConnectionHandle::new(UserId::new(user), 4);
        handle
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let h = handle("1");

        registry.register(h.clone()).await;
        assert!(registry.contains(h.id()).await);
        assert_eq!(registry.len().await, 1);

        let removed = registry.unregister(h.id()).await.unwrap();
        assert_eq!(removed.id(), h.id());
        assert!(h.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let a = handle("1");
        let b = handle("2");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        assert!(registry.unregister(a.id()).await.is_some());
        assert!(registry.unregister(a.id()).await.is_none());

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(b.id()).await);
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_snapshot_matching_filters_by_user() {
        let registry = ConnectionRegistry::new();
        let a1 = handle("1");
        let a2 = handle("1");
        let b = handle("2");
        let c = handle("3");
        for h in [&a1, &a2, &b, &c] {
            registry.register(h.clone()).await;
        }

        let u1 = UserId::new("1");
        let u2 = UserId::new("2");
        let users: HashSet<&UserId> = [&u1, &u2].into_iter().collect();

        let mut ids: Vec<_> = registry
            .snapshot_matching(&users)
            .await
            .iter()
            .map(|h| h.id())
            .collect();
        ids.sort_by_key(|id| id.0);
        let mut expected = vec![a1.id(), a2.id(), b.id()];
        expected.sort_by_key(|id| id.0);
        assert_eq!(ids, expected);

        assert_eq!(registry.connections_for(&u1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_matching_empty_set() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("1")).await;
        assert!(registry.snapshot_matching(&HashSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_signals_every_connection() {
        let registry = ConnectionRegistry::new();
        let a = handle("1");
        let b = handle("2");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
