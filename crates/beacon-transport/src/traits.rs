//! Connection and transport seams.
//!
//! The engine only ever sees typed [`ClientMessage`]s coming in and
//! [`ServerMessage`]s going out; framing and encoding stay in the adapter.

use async_trait::async_trait;
use beacon_protocol::{ClientMessage, ServerMessage};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transport-assigned connection id, reused as the session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// A fresh `conn_`-prefixed id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Length-prefixed MessagePack in binary frames.
    #[default]
    Binary,
    /// JSON in text frames.
    Json,
}

impl FromStr for WireFormat {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" | "msgpack" => Ok(WireFormat::Binary),
            "json" | "text" => Ok(WireFormat::Json),
            other => Err(TransportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone or the connection was already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// A frame could not be decoded into a client message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] beacon_protocol::ProtocolError),

    #[error("Unknown wire format: {0}")]
    UnknownFormat(String),
}

impl TransportError {
    /// Whether the connection can keep going after this error.
    ///
    /// A malformed message is reported to the client; everything else ends
    /// the session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Protocol(_) | TransportError::MessageTooLarge { .. }
        )
    }
}

/// Source of inbound connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next connection. `ConnectionClosed` means the transport
    /// will produce no more.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Short name for logs, such as `websocket` or `memory`.
    fn name(&self) -> &'static str;
}

/// An accepted connection, before it is split into halves.
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// Peer address, when the adapter knows it.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Credential presented when the connection was opened.
    fn credential(&self) -> Option<&str> {
        None
    }

    /// Split into the outbound sink and the inbound stream.
    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageStream>);
}

/// Outbound half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: ServerMessage) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Next client message, or `None` once the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<ClientMessage>, TransportError>;
}
