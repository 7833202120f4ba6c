//! Per-connection lifecycle for notification websockets.
//!
//! Every accepted websocket runs through [`ConnectionHandler::run`], which
//! walks the connection through `Connecting → Open → Closing → Closed`:
//!
//! - On open the connection's outbound half is registered with the
//!   [`ConnectionRegistry`] so broadcasts can reach it.
//! - While open, inbound frames are decoded in arrival order and handed to
//!   the application's [`InboundHandler`]. Malformed frames are logged and
//!   dropped; the connection stays open unless a malformed-frame limit is
//!   configured.
//! - Outbound frames are queued on an unbounded channel and written by a
//!   dedicated writer task, so broadcasting never waits on a socket.
//! - On close the connection is unregistered exactly once, whether teardown
//!   was caused by the client, a transport error, an idle timeout, a policy
//!   violation, or a [`Connection::close`] request from a failed broadcast.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, SendError};

/// Time allowed for the writer task to flush queued frames after close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for connection handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Close connections that send nothing for this long. `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Close a connection after this many consecutive malformed frames.
    /// `0` tolerates malformed frames indefinitely.
    pub max_malformed_frames: u32,
}

/// Application-side consumer of decoded inbound messages.
pub trait InboundHandler: Send + Sync {
    /// Handles one decoded message from connection `id`.
    fn on_message(&self, id: ConnectionId, message: Value);
}

/// Inbound handler that only logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInboundHandler;

impl InboundHandler for LoggingInboundHandler {
    fn on_message(&self, id: ConnectionId, message: Value) {
        debug!(connection_id = %id, message = %message, "Received websocket message");
    }
}

/// Lifecycle state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame.
    ClientClosed,
    /// The inbound stream ended without a close frame.
    EndOfStream,
    /// Reading from the transport failed.
    ReadError,
    /// Writing to the transport failed.
    WriteError,
    /// Teardown was requested through [`Connection::close`].
    Requested,
    /// No frame arrived within the idle timeout.
    IdleTimeout,
    /// Too many consecutive malformed frames.
    PolicyViolation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::ClientClosed => "client closed",
            Self::EndOfStream => "end of stream",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::Requested => "close requested",
            Self::IdleTimeout => "idle timeout",
            Self::PolicyViolation => "malformed frame limit reached",
        };
        f.write_str(reason)
    }
}

/// Shared close flag that wakes the receive loop and the writer task.
#[derive(Debug, Default)]
struct CloseSignal {
    closing: AtomicBool,
    write_failed: AtomicBool,
    wake: Notify,
}

impl CloseSignal {
    /// Marks the connection as closing. Returns `true` on the first call.
    fn trigger(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        if first {
            self.wake.notify_waiters();
        }
        first
    }

    /// Records that the transport rejected a write, then triggers close.
    fn fail_write(&self) {
        self.write_failed.store(true, Ordering::Release);
        self.trigger();
    }

    fn is_triggered(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Acquire)
    }

    async fn triggered(&self) {
        loop {
            let notified = self.wake.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Outbound half of a websocket, registered (weakly) with the registry.
struct Outbox {
    id: ConnectionId,
    frames: mpsc::UnboundedSender<Utf8Bytes>,
    signal: Arc<CloseSignal>,
}

impl Connection for Outbox {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_frame(&self, frame: Utf8Bytes) -> Result<(), SendError> {
        if self.signal.is_triggered() {
            return Err(SendError::Closed(self.id));
        }
        self.frames
            .send(frame)
            .map_err(|_| SendError::Closed(self.id))
    }

    fn close(&self) {
        if self.signal.trigger() {
            debug!(connection_id = %self.id, "Connection close requested");
        }
    }
}

/// Drives registry membership from state transitions.
///
/// Registration happens on `Connecting → Open` and unregistration on
/// `Closing → Closed`. If the owning task is dropped mid-flight the guard
/// unregisters on drop instead, so membership is released exactly once.
struct Lifecycle {
    id: ConnectionId,
    registry: ConnectionRegistry,
    state: ConnectionState,
}

impl Lifecycle {
    fn new(id: ConnectionId, registry: ConnectionRegistry) -> Self {
        Self {
            id,
            registry,
            state: ConnectionState::Connecting,
        }
    }

    fn open(&mut self, conn: &Arc<dyn Connection>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.registry.register(conn);
        self.transition(ConnectionState::Open);
    }

    fn begin_close(&mut self, reason: CloseReason) {
        if self.state != ConnectionState::Open {
            return;
        }
        debug!(connection_id = %self.id, reason = %reason, "Connection closing");
        self.transition(ConnectionState::Closing);
    }

    fn finish(&mut self) {
        if self.state != ConnectionState::Closing {
            return;
        }
        self.registry.unregister(self.id);
        self.transition(ConnectionState::Closed);
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(connection_id = %self.id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if matches!(self.state, ConnectionState::Open | ConnectionState::Closing) {
            self.registry.unregister(self.id);
            self.state = ConnectionState::Closed;
        }
    }
}

/// Runs accepted websocket connections.
///
/// `ConnectionHandler` is `Clone`; clone it into each upgrade callback.
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: ConnectionRegistry,
    inbound: Arc<dyn InboundHandler>,
    settings: ConnectionSettings,
}

impl ConnectionHandler {
    /// Creates a handler that registers connections in `registry` and
    /// dispatches decoded messages to `inbound`.
    pub fn new(
        registry: ConnectionRegistry,
        inbound: Arc<dyn InboundHandler>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry,
            inbound,
            settings,
        }
    }

    /// Serves one upgraded connection until it closes.
    ///
    /// Returns the reason the connection left the `Open` state. By the time
    /// this returns the connection is no longer registered.
    pub async fn run<S, E>(&self, socket: S) -> CloseReason
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: fmt::Display + Send,
        E: fmt::Display + Send,
    {
        let id = ConnectionId::new();
        let mut lifecycle = Lifecycle::new(id, self.registry.clone());
        let (mut sink, mut stream) = socket.split();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Utf8Bytes>();
        let signal = Arc::new(CloseSignal::default());

        let outbox: Arc<dyn Connection> = Arc::new(Outbox {
            id,
            frames: frames_tx,
            signal: Arc::clone(&signal),
        });

        // Drains queued frames in order; once closing, flushes what is left.
        let writer_signal = Arc::clone(&signal);
        let mut writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = frames_rx.recv() => frame,
                    () = writer_signal.triggered() => frames_rx.try_recv().ok(),
                };
                let Some(frame) = frame else {
                    break;
                };
                if let Err(err) = sink.send(Message::Text(frame)).await {
                    debug!(connection_id = %id, error = %err, "Failed to write frame");
                    writer_signal.fail_write();
                    return;
                }
            }
            if let Err(err) = sink.close().await {
                trace!(connection_id = %id, error = %err, "Close handshake not completed");
            }
        });

        lifecycle.open(&outbox);
        info!(connection_id = %id, "WebSocket client connected");

        let mut malformed: u32 = 0;
        let reason = loop {
            let next = tokio::select! {
                biased;
                () = signal.triggered() => break CloseReason::Requested,
                () = idle(self.settings.idle_timeout) => break CloseReason::IdleTimeout,
                next = stream.next() => next,
            };

            let payload = match next {
                Some(Ok(Message::Text(text))) => codec::decode(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => codec::decode(&bytes),
                Some(Ok(Message::Ping(data))) => {
                    trace!(connection_id = %id, data_len = data.len(), "Received ping");
                    continue;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                Some(Err(err)) => {
                    debug!(connection_id = %id, error = %err, "WebSocket read error");
                    break CloseReason::ReadError;
                }
                None => break CloseReason::EndOfStream,
            };

            match payload {
                Ok(message) => {
                    malformed = 0;
                    self.inbound.on_message(id, message);
                }
                Err(err) => {
                    malformed += 1;
                    warn!(
                        connection_id = %id,
                        error = %err,
                        consecutive = malformed,
                        "Dropped malformed websocket frame"
                    );
                    let limit = self.settings.max_malformed_frames;
                    if limit > 0 && malformed >= limit {
                        break CloseReason::PolicyViolation;
                    }
                }
            }
        };

        let reason = if reason == CloseReason::Requested && signal.write_failed() {
            CloseReason::WriteError
        } else {
            reason
        };

        lifecycle.begin_close(reason);
        signal.trigger();
        lifecycle.finish();
        drop(outbox);

        if !writer.is_finished()
            && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
        {
            writer.abort();
        }

        debug_assert_eq!(lifecycle.state(), ConnectionState::Closed);
        info!(connection_id = %id, reason = %reason, "WebSocket client disconnected");
        reason
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Resolves after `timeout`, or never when no timeout is configured.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
