//! Notification broadcasting for the Beer API server.
//!
//! This module provides the fan-out path from HTTP write handlers to every
//! connected websocket client. It is best-effort and fire-and-forget: a
//! message reaches the connections that are registered when the broadcast
//! starts, nothing is retried, and nothing is acknowledged.
//!
//! # Architecture
//!
//! The broadcast system consists of two parts:
//!
//! - [`Notifier`] - The narrow capability write handlers depend on
//! - [`Broadcaster`] - The live implementation that encodes a message once
//!   and pushes the frame to every member of the [`ConnectionRegistry`]
//!
//! [`NoopNotifier`] stands in for the live implementation when notifications
//! are not wanted, such as in handler tests.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::broadcast::{Broadcaster, Notifier};
//! use beerapi_server::registry::ConnectionRegistry;
//! use serde_json::json;
//!
//! let registry = ConnectionRegistry::new();
//! let broadcaster = Broadcaster::new(registry);
//!
//! // No listeners yet, so nothing is delivered.
//! let report = broadcaster.broadcast(&json!({"action": "beer_comment"}));
//! assert_eq!(report.delivered, 0);
//!
//! // Write handlers only see the `Notifier` capability.
//! let notifier: &dyn Notifier = &broadcaster;
//! notifier.notify(&json!({"hello": "world"}));
//! ```

use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::codec;
use crate::registry::ConnectionRegistry;

/// Capability to announce a completed write to real-time listeners.
///
/// Implementations must never fail the caller: the write has already been
/// persisted by the time `notify` runs.
pub trait Notifier: Send + Sync {
    /// Announces `message` to every current listener.
    fn notify(&self, message: &Value);
}

/// Notifier that discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, message: &Value) {
        trace!(message = %message, "Notification discarded");
    }
}

/// Outcome of a single broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was handed to.
    pub delivered: usize,

    /// Connections whose send failed; each was asked to close.
    pub failed: usize,
}

/// Fans messages out to every registered connection.
///
/// `Broadcaster` is `Clone`; clones share the same registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    /// Creates a broadcaster over `registry`.
    #[must_use]
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Encodes `message` once and queues it on every live connection.
    ///
    /// A failed send is isolated to that connection: it is logged, the
    /// connection is asked to close, and the remaining connections still
    /// receive the frame. An encode failure aborts the broadcast and is
    /// logged; it never propagates to the caller.
    pub fn broadcast<T>(&self, message: &T) -> BroadcastReport
    where
        T: Serialize + ?Sized,
    {
        let frame = match codec::encode(message) {
            Ok(text) => Utf8Bytes::from(text),
            Err(err) => {
                error!(error = %err, "Broadcast aborted, message could not be encoded");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        for conn in self.registry.snapshot() {
            match conn.send_frame(frame.clone()) {
                Ok(()) => {
                    trace!(connection_id = %conn.id(), "Frame queued");
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(connection_id = %conn.id(), error = %err, "Broadcast send failed");
                    conn.close();
                    report.failed += 1;
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            bytes = frame.as_str().len(),
            "Broadcast complete"
        );
        report
    }
}

impl Notifier for Broadcaster {
    fn notify(&self, message: &Value) {
        self.broadcast(message);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::codec::decode;
    use crate::registry::testing::MockConnection;
    use crate::registry::Connection;

    fn register(registry: &ConnectionRegistry, conn: &Arc<MockConnection>) {
        let conn: Arc<dyn Connection> = conn.clone();
        registry.register(&conn);
    }

    #[test]
    fn broadcast_reaches_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let conns: Vec<_> = (0..3).map(|_| MockConnection::new()).collect();
        for conn in &conns {
            register(&registry, conn);
        }

        let report = Broadcaster::new(registry).broadcast(&json!({"x": 1}));

        assert_eq!(report, BroadcastReport { delivered: 3, failed: 0 });
        for conn in &conns {
            let frames = conn.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(decode(frames[0].as_bytes()).unwrap(), json!({"x": 1}));
        }
    }

    #[test]
    fn failed_send_does_not_stop_other_deliveries() {
        let registry = ConnectionRegistry::new();
        let healthy_a = MockConnection::new();
        let broken = MockConnection::failing();
        let healthy_b = MockConnection::new();
        register(&registry, &healthy_a);
        register(&registry, &broken);
        register(&registry, &healthy_b);

        let report = Broadcaster::new(registry).broadcast(&json!({"x": 1}));

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(healthy_a.frames().len(), 1);
        assert_eq!(healthy_b.frames().len(), 1);
        assert!(broken.frames().is_empty());
    }

    #[test]
    fn failed_send_schedules_teardown() {
        let registry = ConnectionRegistry::new();
        let broken = MockConnection::failing();
        let healthy = MockConnection::new();
        register(&registry, &broken);
        register(&registry, &healthy);

        Broadcaster::new(registry).broadcast(&json!({"x": 1}));

        assert!(broken.is_closed());
        assert!(!healthy.is_closed());
    }

    #[test]
    fn broadcast_with_no_connections_delivers_nothing() {
        let report = Broadcaster::new(ConnectionRegistry::new()).broadcast(&json!({"x": 1}));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn unencodable_message_is_dropped_without_panicking() {
        let registry = ConnectionRegistry::new();
        let conn = MockConnection::new();
        register(&registry, &conn);

        let mut bad = BTreeMap::new();
        bad.insert((1, 2), "tuple keys are not JSON");

        let report = Broadcaster::new(registry).broadcast(&bad);

        assert_eq!(report, BroadcastReport::default());
        assert!(conn.frames().is_empty());
    }

    #[test]
    fn unregistered_connection_misses_later_broadcasts() {
        let registry = ConnectionRegistry::new();
        let conn = MockConnection::new();
        register(&registry, &conn);
        let broadcaster = Broadcaster::new(registry.clone());

        broadcaster.broadcast(&json!({"seq": 1}));
        registry.unregister(conn.id());
        broadcaster.broadcast(&json!({"seq": 2}));

        assert_eq!(conn.frames(), vec![r#"{"seq":1}"#.to_string()]);
    }

    #[test]
    fn notifier_forwards_to_broadcast() {
        let registry = ConnectionRegistry::new();
        let conn = MockConnection::new();
        register(&registry, &conn);

        let notifier: Arc<dyn Notifier> = Arc::new(Broadcaster::new(registry));
        notifier.notify(&json!({"action": "beer_comment", "user": "u", "beer": "b"}));

        assert_eq!(
            decode(conn.frames()[0].as_bytes()).unwrap(),
            json!({"action": "beer_comment", "user": "u", "beer": "b"})
        );
    }

    #[test]
    fn noop_notifier_accepts_anything() {
        NoopNotifier.notify(&json!({"ignored": true}));
    }
}
