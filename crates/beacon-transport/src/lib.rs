//! # beacon-transport
//!
//! Transport abstraction layer for the Beacon event engine.
//!
//! This crate provides a unified interface over the ways clients reach the
//! engine:
//!
//! - **WebSocket** - axum upgrade, binary (MessagePack) or JSON text frames
//! - **Memory** - in-process pairs for tests and embedding
//!
//! ## Transport Abstraction
//!
//! A [`Connection`] splits into an inbound [`MessageStream`] and an outbound
//! [`MessageSink`], so the session loop can read while a writer task drains
//! the outbound queue.
//!
//! ```rust,ignore
//! use beacon_transport::Connection;
//!
//! async fn handle(conn: Box<dyn Connection>) {
//!     let (mut sink, mut stream) = conn.split();
//!     while let Ok(Some(message)) = stream.recv().await {
//!         // Dispatch message
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    Connection, ConnectionId, MessageSink, MessageStream, Transport, TransportError, WireFormat,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
