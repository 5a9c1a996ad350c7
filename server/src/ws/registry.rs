//! Per-user connection registry and targeted delivery.
//!
//! Maps a user id to the single connection currently registered under it.
//! Each entry remembers which connection it belongs to, so a connection that
//! was replaced by a newer registration cannot evict its successor when it
//! tears down.

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Sender half of a connection's outbound queue. The writer task owns the receiver.
pub type ConnectionSender = mpsc::Sender<Message>;

/// Process-unique identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning reference to a live connection: its id plus the queue its
/// writer task drains. Holding a handle does not keep the socket alive.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: ConnectionSender,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True while the writer task is still draining the queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame without waiting for room.
    pub fn try_send(&self, msg: Message) -> Result<(), TrySendError<Message>> {
        self.tx.try_send(msg)
    }
}

/// Outcome of a targeted delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload queued for the peer.
    Sent,
    /// No connection is registered under the user id.
    Offline,
    /// A connection is registered but its transport is no longer open.
    Closed,
    /// The peer is not draining its queue; the payload was dropped.
    Saturated,
}

impl Delivery {
    pub fn is_sent(self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: DashMap<String, ConnectionHandle>,
    next_id: AtomicU64,
}

/// Shared registry of registered connections, keyed by user id.
/// Cheap to clone; all clones see the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the outbound queue for a freshly accepted connection.
    /// The returned handle is not registered yet.
    pub fn open_channel(&self, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        (ConnectionHandle { id, tx }, rx)
    }

    /// Register `handle` under `user_id`, replacing any existing entry.
    /// Returns the id of the replaced connection. The replaced connection is
    /// left open; it deregisters itself (as a no-op) when it closes.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionId> {
        let id = handle.id;
        let replaced = self
            .inner
            .entries
            .insert(user_id.to_string(), handle)
            .map(|old| old.id);

        match replaced {
            Some(old_id) => tracing::info!(
                user_id = %user_id,
                connection_id = %id,
                replaced_connection_id = %old_id,
                "Connection registered, replacing previous registration"
            ),
            None => tracing::info!(
                user_id = %user_id,
                connection_id = %id,
                "Connection registered"
            ),
        }

        replaced
    }

    /// Remove the entry for `user_id` only if it still belongs to connection `id`.
    /// Returns true if an entry was removed.
    pub fn unregister(&self, user_id: &str, id: ConnectionId) -> bool {
        let removed = self
            .inner
            .entries
            .remove_if(user_id, |_, handle| handle.id == id)
            .is_some();

        if removed {
            tracing::debug!(user_id = %user_id, connection_id = %id, "Connection unregistered");
        } else {
            tracing::debug!(
                user_id = %user_id,
                connection_id = %id,
                "Connection no longer owns its registry entry, nothing to remove"
            );
        }
        removed
    }

    /// Attempt to deliver `message` to the connection registered under `user_id`.
    ///
    /// One lookup, at most one non-blocking enqueue. Never mutates the registry:
    /// stale entries are left for the owning connection's own cleanup.
    pub fn deliver(&self, user_id: &str, message: impl Into<String>) -> Delivery {
        let Some(handle) = self.inner.entries.get(user_id).map(|e| e.value().clone()) else {
            tracing::info!(user_id = %user_id, "Delivery target not connected");
            return Delivery::Offline;
        };

        if !handle.is_open() {
            return transport_closed(user_id, handle.id);
        }

        let message: String = message.into();
        let len = message.len();
        match handle.try_send(Message::Text(message.into())) {
            Ok(()) => {
                tracing::info!(
                    user_id = %user_id,
                    connection_id = %handle.id,
                    bytes = len,
                    "Delivered message"
                );
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id = %handle.id,
                    "Outbound queue full, dropping message"
                );
                Delivery::Saturated
            }
            Err(TrySendError::Closed(_)) => transport_closed(user_id, handle.id),
        }
    }

    /// Boolean form of [`deliver`](Self::deliver) for callers that only need
    /// to know whether the payload went out.
    pub fn send_to_user(&self, user_id: &str, message: impl Into<String>) -> bool {
        self.deliver(user_id, message).is_sent()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.inner
            .entries
            .get(user_id)
            .map(|e| e.value().is_open())
            .unwrap_or(false)
    }

    /// The id of the connection currently registered under `user_id`, if any.
    pub fn connection_id(&self, user_id: &str) -> Option<ConnectionId> {
        self.inner.entries.get(user_id).map(|e| e.value().id)
    }

    pub fn connected_users(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

/// The entry is still registered but its writer is gone. Left in place for
/// the owning connection's cleanup.
fn transport_closed(user_id: &str, connection_id: ConnectionId) -> Delivery {
    tracing::info!(
        user_id = %user_id,
        connection_id = %connection_id,
        "Delivery target registered but transport is not open"
    );
    Delivery::Closed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_deliver_to_unknown_user_is_offline() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.deliver("ghost", "x"), Delivery::Offline);
        assert!(!registry.send_to_user("ghost", "x"));
    }

    #[test]
    fn test_register_then_deliver() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.open_channel(8);

        assert_eq!(registry.register("u1", handle), None);
        assert!(registry.send_to_user("u1", "hello"));
        assert_eq!(text_of(rx.try_recv().unwrap()), "hello");
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.open_channel(8);
        let (b, mut rx_b) = registry.open_channel(8);
        let a_id = a.id();

        registry.register("u1", a);
        assert_eq!(registry.register("u1", b), Some(a_id));
        assert_eq!(registry.len(), 1);

        assert!(registry.send_to_user("u1", "m"));
        assert_eq!(text_of(rx_b.try_recv().unwrap()), "m");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_stale_unregister_keeps_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.open_channel(8);
        let (b, _rx_b) = registry.open_channel(8);
        let (a_id, b_id) = (a.id(), b.id());

        registry.register("u1", a);
        registry.register("u1", b);

        assert!(!registry.unregister("u1", a_id));
        assert_eq!(registry.connection_id("u1"), Some(b_id));

        assert!(registry.unregister("u1", b_id));
        assert!(!registry.unregister("u1", b_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deliver_to_closed_transport_leaves_entry() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.open_channel(8);
        registry.register("u1", handle);
        drop(rx);

        assert_eq!(registry.deliver("u1", "x"), Delivery::Closed);
        assert!(!registry.is_connected("u1"));
        // Delivery never repairs the registry.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_full_queue_is_saturated() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.open_channel(1);
        registry.register("u1", handle);

        assert_eq!(registry.deliver("u1", "first"), Delivery::Sent);
        assert_eq!(registry.deliver("u1", "second"), Delivery::Saturated);

        assert_eq!(text_of(rx.try_recv().unwrap()), "first");
        assert_eq!(registry.deliver("u1", "third"), Delivery::Sent);
    }

    #[test]
    fn test_deliver_does_not_change_entries() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.open_channel(8);
        let id = handle.id();
        registry.register("u1", handle);

        for _ in 0..3 {
            registry.deliver("u1", "x");
            registry.deliver("nobody", "x");
        }
        assert_eq!(registry.connected_users(), vec!["u1".to_string()]);
        assert_eq!(registry.connection_id("u1"), Some(id));
    }


    #[test]
    fn test_connection_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let (a, _) = registry.open_channel(1);
        let (b, _) = registry.open_channel(1);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_keep_one_entry_per_user() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();

        for _ in 0..32 {
            let (handle, rx) = registry.open_channel(4);
            receivers.push(rx);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.register("shared", handle);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        assert!(registry.send_to_user("shared", "only-one"));
        let delivered = receivers
            .iter_mut()
            .map(|rx| rx.try_recv().is_ok())
            .filter(|received| *received)
            .count();
        assert_eq!(delivered, 1);
    }
}
