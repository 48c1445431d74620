use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatfleet_core::models::PresenceEntry;
use chatfleet_core::protocol::ServerFrame;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to one authenticated client connection on this worker.
///
/// Cloning is cheap; all clones feed the same outgoing queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub username: String,
    /// The presence entry written when this connection was accepted
    pub presence: PresenceEntry,
    pub connected_at: Instant,
    sender: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(
        presence: PresenceEntry,
        sender: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id: nanoid::nanoid!(12),
            username: presence.username.clone(),
            presence,
            connected_at: Instant::now(),
            sender,
            cancel,
        }
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: ServerFrame) -> Delivery {
        match self.sender.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NotConnected,
        }
    }

    /// Send a last frame and end the connection.
    ///
    /// The writer flushes frames already queued, including `farewell`,
    /// before closing the socket.
    pub fn close_with(&self, farewell: ServerFrame) {
        let _ = self.sender.try_send(farewell);
        self.cancel.cancel();
    }

    /// End the connection without a final frame.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No local connection for the username
    NotConnected,
    /// The connection's outgoing queue is full
    QueueFull,
}

/// Connections accepted by this worker, keyed by username.
///
/// A username has at most one local connection; registering a second one
/// closes the first.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<String, ConnectionHandle>>,

    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any local connection of the same user.
    pub fn register(&self, handle: ConnectionHandle) {
        let username = handle.username.clone();
        let connection_id = handle.connection_id.clone();

        if let Some(previous) = self.connections.insert(username.clone(), handle) {
            info!(
                username = %username,
                connection_id = %previous.connection_id,
                "Closing connection replaced by a newer login on this worker"
            );
            previous.close_with(ServerFrame::Evicted);
        }

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(
            username = %username,
            connection_id = %connection_id,
            active_connections = self.connections.len(),
            "Connection registered"
        );
    }

    /// Remove the connection if it is still the registered one for its user.
    pub fn unregister(&self, username: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(username, |_, handle| handle.connection_id == connection_id);

        if let Some((_, handle)) = &removed {
            info!(
                username = %username,
                connection_id = %connection_id,
                duration = ?handle.duration(),
                "Connection unregistered"
            );
        }
        removed.is_some()
    }

    #[must_use]
    pub fn get(&self, username: &str) -> Option<ConnectionHandle> {
        self.connections.get(username).map(|h| h.clone())
    }

    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.connections.contains_key(username)
    }

    pub fn deliver(&self, username: &str, frame: ServerFrame) -> Delivery {
        let Some(handle) = self.get(username) else {
            return Delivery::NotConnected;
        };

        let result = handle.try_send(frame);
        match result {
            Delivery::Delivered => {
                self.total_messages.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::QueueFull => {
                warn!(username = %username, "Outgoing queue full");
            }
            Delivery::NotConnected => {
                debug!(username = %username, "Connection already closed");
            }
        }
        result
    }

    /// Send `frame` to every local connection without closing them.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().try_send(frame.clone()) == Delivery::Delivered)
            .count()
    }

    /// Close every local connection without a final frame.
    pub fn disconnect_all(&self) -> usize {
        let handles = self.handles();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }

    #[must_use]
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.connection_count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(username: &str, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let presence = PresenceEntry::new(username, "worker-1", None);
        (ConnectionHandle::new(presence, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn test_register_and_deliver() {
        let manager = ConnectionManager::new();
        let (alice, mut rx) = handle("alice", 8);
        manager.register(alice);

        assert_eq!(
            manager.deliver("alice", ServerFrame::error("x")),
            Delivery::Delivered
        );
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::error("x"));
        assert_eq!(
            manager.deliver("bob", ServerFrame::error("x")),
            Delivery::NotConnected
        );
        assert_eq!(manager.metrics().total_messages, 1);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let manager = ConnectionManager::new();
        let (alice, _rx) = handle("alice", 1);
        manager.register(alice);

        assert_eq!(manager.deliver("alice", ServerFrame::Evicted), Delivery::Delivered);
        assert_eq!(manager.deliver("alice", ServerFrame::Evicted), Delivery::QueueFull);
    }

    #[test]
    fn test_second_local_login_closes_first() {
        let manager = ConnectionManager::new();
        let (first, mut first_rx) = handle("alice", 8);
        let (second, _second_rx) = handle("alice", 8);
        let first_id = first.connection_id.clone();
        let first_clone = first.clone();

        manager.register(first);
        manager.register(second);

        assert_eq!(manager.connection_count(), 1);
        assert!(first_clone.is_closed());
        assert_eq!(first_rx.try_recv().unwrap(), ServerFrame::Evicted);

        // Teardown of the replaced connection leaves the new one alone
        assert!(!manager.unregister("alice", &first_id));
        assert!(manager.contains("alice"));
    }

    #[test]
    fn test_broadcast_then_disconnect() {
        let manager = ConnectionManager::new();
        let (alice, mut alice_rx) = handle("alice", 8);
        let (bob, _bob_rx) = handle("bob", 8);
        manager.register(alice);
        manager.register(bob);

        let frame = ServerFrame::Maintenance {
            reconnect_after_ms: 3000,
        };
        assert_eq!(manager.broadcast(&frame), 2);
        assert_eq!(alice_rx.try_recv().unwrap(), frame);
        assert!(manager.handles().iter().all(|h| !h.is_closed()));

        assert_eq!(manager.disconnect_all(), 2);
        assert!(manager.handles().iter().all(ConnectionHandle::is_closed));
    }
}
