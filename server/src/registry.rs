//! Registry of live notification connections.
//!
//! The registry is the shared set every broadcast iterates over. It holds
//! only [`Weak`] handles: each connection task owns its transport and the
//! strong [`Arc`] to its outbound half, so a connection that has been torn
//! down can never be kept alive (or written to) through the registry.
//!
//! # Thread Safety
//!
//! [`ConnectionRegistry`] is `Clone` and cheap to share; all clones see the
//! same set. Mutation and snapshotting are serialized through a [`RwLock`]
//! that is never held while sending, so a slow client cannot stall
//! connects or disconnects.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use beerapi_server::registry::{Connection, ConnectionId, ConnectionRegistry, SendError};
//!
//! struct Silent(ConnectionId);
//!
//! impl Connection for Silent {
//!     fn id(&self) -> ConnectionId {
//!         self.0
//!     }
//!     fn send_frame(&self, _frame: axum::extract::ws::Utf8Bytes) -> Result<(), SendError> {
//!         Ok(())
//!     }
//!     fn close(&self) {}
//! }
//!
//! let registry = ConnectionRegistry::new();
//! let conn: Arc<dyn Connection> = Arc::new(Silent(ConnectionId::new()));
//!
//! assert!(registry.register(&conn));
//! assert!(!registry.register(&conn));
//! assert_eq!(registry.snapshot().len(), 1);
//!
//! assert!(registry.unregister(conn.id()));
//! assert!(!registry.unregister(conn.id()));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Unique identifier assigned to each connection when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Failure to hand a frame to a connection's transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The connection has already started tearing down.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// The transport rejected the frame.
    #[error("transport error on connection {id}: {reason}")]
    Transport { id: ConnectionId, reason: String },
}

/// The outbound half of a live connection, as seen by broadcasters.
///
/// Implementations must not block: `send_frame` queues the frame and returns.
pub trait Connection: Send + Sync {
    /// Identifier used for registry membership.
    fn id(&self) -> ConnectionId;

    /// Queues one text frame for delivery.
    fn send_frame(&self, frame: Utf8Bytes) -> Result<(), SendError>;

    /// Requests teardown. Safe to call any number of times.
    fn close(&self);
}

/// Process-wide set of live connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    members: Arc<RwLock<HashMap<ConnectionId, Weak<dyn Connection>>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to the registry.
    ///
    /// Returns `false` (and changes nothing) if a connection with the same id
    /// is already present.
    pub fn register(&self, conn: &Arc<dyn Connection>) -> bool {
        let id = conn.id();
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);

        if members.contains_key(&id) {
            trace!(connection_id = %id, "Connection already registered");
            return false;
        }

        members.insert(id, Arc::downgrade(conn));
        debug!(connection_id = %id, connections = members.len(), "Connection registered");
        true
    }

    /// Removes the connection with `id`.
    ///
    /// Returns `false` if it was not present; that is not an error.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let removed = members.remove(&id).is_some();

        if removed {
            debug!(connection_id = %id, connections = members.len(), "Connection unregistered");
        } else {
            trace!(connection_id = %id, "Unregister ignored for unknown connection");
        }
        removed
    }

    /// Returns strong handles to every member that is still alive.
    ///
    /// The returned list is independent of the registry, so callers may send
    /// to it while other tasks connect and disconnect.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        members.values().filter_map(Weak::upgrade).collect()
    }

    /// Returns `true` if `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory connection that records every frame it is sent.
    pub(crate) struct MockConnection {
        id: ConnectionId,
        fail_sends: bool,
        closed: AtomicBool,
        frames: Mutex<Vec<String>>,
    }

    impl MockConnection {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(),
                fail_sends: false,
                closed: AtomicBool::new(false),
                frames: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(),
                fail_sends: true,
                closed: AtomicBool::new(false),
                frames: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Connection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send_frame(&self, frame: Utf8Bytes) -> Result<(), SendError> {
            if self.fail_sends {
                return Err(SendError::Transport {
                    id: self.id,
                    reason: "broken pipe".to_string(),
                });
            }
            self.frames.lock().unwrap().push(frame.as_str().to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockConnection;
    use super::*;

    fn as_dyn(conn: &Arc<MockConnection>) -> Arc<dyn Connection> {
        conn.clone()
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn register_twice_keeps_one_entry() {
        let registry = ConnectionRegistry::new();
        let conn = as_dyn(&MockConnection::new());

        assert!(registry.register(&conn));
        assert!(!registry.register(&conn));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.contains(conn.id()));
    }

    #[test]
    fn unregister_absent_is_noop() {
        let registry = ConnectionRegistry::new();
        let member = as_dyn(&MockConnection::new());
        registry.register(&member);

        assert!(!registry.unregister(ConnectionId::new()));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(member.id()));
    }

    #[test]
    fn double_unregister_is_safe() {
        let registry = ConnectionRegistry::new();
        let conn = as_dyn(&MockConnection::new());
        registry.register(&conn);

        assert!(registry.unregister(conn.id()));
        assert!(!registry.unregister(conn.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_skips_dropped_connections() {
        let registry = ConnectionRegistry::new();
        let kept = as_dyn(&MockConnection::new());
        let dropped = as_dyn(&MockConnection::new());
        registry.register(&kept);
        registry.register(&dropped);
        drop(dropped);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), kept.id());
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let registry = ConnectionRegistry::new();
        let a = as_dyn(&MockConnection::new());
        let b = as_dyn(&MockConnection::new());
        registry.register(&a);
        registry.register(&b);

        let snapshot = registry.snapshot();
        registry.unregister(a.id());
        registry.unregister(b.id());

        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_membership() {
        let registry = ConnectionRegistry::new();
        let clone = registry.clone();
        let conn = as_dyn(&MockConnection::new());

        clone.register(&conn);
        assert!(registry.contains(conn.id()));
    }

    #[test]
    fn concurrent_register_and_unregister_lose_nothing() {
        let registry = ConnectionRegistry::new();
        let conns: Vec<Arc<dyn Connection>> =
            (0..64).map(|_| as_dyn(&MockConnection::new())).collect();

        std::thread::scope(|scope| {
            for chunk in conns.chunks(8) {
                let registry = registry.clone();
                scope.spawn(move || {
                    for conn in chunk {
                        registry.register(conn);
                        let _ = registry.snapshot();
                    }
                });
            }
        });
        assert_eq!(registry.len(), 64);

        std::thread::scope(|scope| {
            for chunk in conns.chunks(8) {
                let registry = registry.clone();
                scope.spawn(move || {
                    for conn in chunk {
                        registry.unregister(conn.id());
                    }
                });
            }
        });
        assert!(registry.is_empty());
    }

    #[test]
    fn connection_id_displays_as_uuid() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string().len(), 36);
    }
}
