//! Live connection handles keyed by user.
//!
//! The registry is a pure delivery primitive: it knows which handle currently
//! speaks for a user id and nothing about rooms. Delivery is best-effort and
//! at-most-once. Each handle feeds a bounded queue. A handle whose receiving
//! side is gone, or whose queue is full because the peer stopped reading, is
//! dropped from the registry on the first failed send and reported as a
//! casualty, so the hub can run the same teardown it runs for a closed socket.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::UserId;

/// An encoded outbound frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The sending half of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its socket writer drains.
    ///
    /// The queue holds at most `capacity` frames (at least one).
    #[must_use]
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    /// Create a handle with a generated connection ID and the default capacity.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<Frame>) {
        Self::with_capacity(DEFAULT_OUTBOUND_QUEUE)
    }

    /// Create a handle with a generated connection ID.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::new(ConnectionId::generate(), capacity)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `false` if the queue is full or the receiving side is gone.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(connection = %self.id, "Outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Check if the receiving side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registry of live connection handles.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: DashMap<UserId, ConnectionHandle>,
    /// Users whose handle failed during delivery and still need teardown.
    casualties: Mutex<Vec<(UserId, ConnectionId)>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handle to a user, replacing any previous handle.
    ///
    /// Returns the displaced handle, if any. It is not closed here.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        debug!(user = %user_id, connection = %handle.id(), "Registered connection");
        self.handles.insert(user_id.to_string(), handle)
    }

    /// Remove a user's handle.
    ///
    /// Returns `true` if an entry existed.
    pub fn unregister(&self, user_id: &str) -> bool {
        let removed = self.handles.remove(user_id).is_some();
        if removed {
            debug!(user = %user_id, "Unregistered connection");
        }
        removed
    }

    /// Remove a user's handle only if it belongs to `connection_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &ConnectionId) -> bool {
        let removed = self
            .handles
            .remove_if(user_id, |_, handle| handle.id() == connection_id)
            .is_some();
        if removed {
            debug!(user = %user_id, connection = %connection_id, "Unregistered connection");
        }
        removed
    }

    /// Deliver a frame to a user's current handle.
    ///
    /// Missing users are ignored. A failed send unregisters the handle and
    /// records the user as a casualty; the failure never reaches the caller.
    pub fn send_to(&self, user_id: &str, frame: &Frame) {
        // Clone out of the map so the shard lock is released before removal.
        let Some(handle) = self.handles.get(user_id).map(|h| h.value().clone()) else {
            trace!(user = %user_id, "Send to unregistered user");
            return;
        };

        if handle.send(Arc::clone(frame)) {
            trace!(user = %user_id, "Delivered frame");
            return;
        }

        debug!(user = %user_id, connection = %handle.id(), "Delivery failed, dropping handle");
        if self.unregister_connection(user_id, handle.id()) {
            self.casualties
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((user_id.to_string(), handle.id().clone()));
        }
    }

    /// Drain the users whose handles failed since the last call.
    pub fn take_casualties(&self) -> Vec<(UserId, ConnectionId)> {
        std::mem::take(&mut *self.casualties.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Get the connection currently bound to a user.
    #[must_use]
    pub fn connection_id(&self, user_id: &str) -> Option<ConnectionId> {
        self.handles.get(user_id).map(|h| h.id().clone())
    }

    /// Check if a user has a registered handle.
    #[must_use]
    pub fn is_connected(&self, user_id: &str) -> bool {
        self.handles.contains_key(user_id)
    }

    /// Get the number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::channel();

        assert!(registry.register("alice", handle).is_none());
        assert!(registry.is_connected("alice"));

        registry.send_to("alice", &frame("hello"));
        assert_eq!(&*rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_register_replaces_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, mut second_rx) = ConnectionHandle::channel();
        let first_id = first.id().clone();

        registry.register("alice", first);
        let displaced = registry.register("alice", second).unwrap();
        assert_eq!(displaced.id(), &first_id);
        assert_eq!(registry.len(), 1);

        registry.send_to("alice", &frame("x"));
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());
    }

    #[test]
    fn test_unregister() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();
        registry.register("alice", handle);

        assert!(registry.unregister("alice"));
        assert!(!registry.unregister("alice"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_connection_ignores_other_connections() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = ConnectionHandle::channel();
        let (new, _new_rx) = ConnectionHandle::channel();
        let old_id = old.id().clone();
        let new_id = new.id().clone();

        registry.register("alice", old);
        registry.register("alice", new);

        assert!(!registry.unregister_connection("alice", &old_id));
        assert_eq!(registry.connection_id("alice"), Some(new_id.clone()));
        assert!(registry.unregister_connection("alice", &new_id));
    }

    #[test]
    fn test_full_queue_unregisters_and_records_casualty() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::with_capacity(2);
        let id = handle.id().clone();
        registry.register("alice", handle);

        registry.send_to("alice", &frame("one"));
        registry.send_to("alice", &frame("two"));
        assert!(registry.is_connected("alice"));
        assert!(registry.take_casualties().is_empty());

        // The peer stopped reading; the third frame does not fit.
        registry.send_to("alice", &frame("three"));

        assert!(!registry.is_connected("alice"));
        assert_eq!(registry.take_casualties(), vec![("alice".to_string(), id)]);

        // Queued frames are still drained, then the queue reports closed.
        assert_eq!(&*rx.try_recv().unwrap(), "one");
        assert_eq!(&*rx.try_recv().unwrap(), "two");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_send_to_missing_user_is_silent() {
        let registry = ConnectionRegistry::new();
        registry.send_to("nobody", &frame("x"));
        assert!(registry.take_casualties().is_empty());
    }

    #[test]
    fn test_failed_send_unregisters_and_records_casualty() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::channel();
        let id = handle.id().clone();
        registry.register("alice", handle);
        drop(rx);

        registry.send_to("alice", &frame("x"));

        assert!(!registry.is_connected("alice"));
        assert_eq!(registry.take_casualties(), vec![("alice".to_string(), id)]);
        assert!(registry.take_casualties().is_empty());
    }
}
