//! Relay Transport: framed JSON over persistent WebSocket connections
//!
//! Both client links and node → node links use the same abstraction: a
//! [`ConnectionHandle`] that queues outbound text frames onto the connection's
//! writer, and a [`FrameHandler`] that receives each whole inbound frame.

pub mod websocket;

pub use websocket::{accept_loop, dial, drive_connection, normalize_address};

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::WireMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Writer-side instruction for a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Transport error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Cloneable sending side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its connection task drains.
    pub fn new(remote: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                remote: remote.into(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote socket address or dialed address
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Queue an already-serialized frame, byte for byte.
    pub fn send_raw(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Frame(frame.into()))
            .map_err(|_| TransportError::Closed)
    }

    pub fn send(&self, message: &WireMessage) -> Result<(), TransportError> {
        let frame = message
            .to_json()
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        self.send_raw(frame)
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receives whole inbound frames for every connection.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, connection: &ConnectionHandle, frame: &str);

    /// Called once after the connection's read side ends.
    fn on_close(&self, connection: &ConnectionHandle);
}
