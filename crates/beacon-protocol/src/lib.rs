//! # beacon-protocol
//!
//! Wire protocol definitions for the Beacon realtime event distribution engine.
//!
//! This crate defines the messages exchanged between Beacon clients and
//! servers, the codecs used to put them on the wire, and the stable error
//! codes reported to clients.
//!
//! ## Message Families
//!
//! - `join_room` / `leave_room` - Room membership
//! - `subscribe_events` / `subscribe_metrics` - Interest registration
//! - `set_presence_status` / `heartbeat` - Presence
//! - `publish_metric` / `collaborate_dashboard` - Producing events
//! - `error` / `server_shutdown` - Failures and lifecycle notices
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, ClientMessage};
//!
//! let message = ClientMessage::join_room("dashboard:acme:sales");
//!
//! // Binary (MessagePack) framing
//! let encoded = codec::encode(&message).unwrap();
//! let decoded: ClientMessage = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod codes;
pub mod messages;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use messages::{
    ActivityFilters, ClientMessage, MessageType, MetricKind, MetricSubscriptionOptions,
    ServerMessage,
};
