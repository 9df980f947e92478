//! Stable, machine-readable error codes sent in `error` messages.
//!
//! Clients switch on these strings, so they never change once released.

pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
pub const DUPLICATE_SESSION: &str = "DUPLICATE_SESSION";
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const ROOM_FULL: &str = "ROOM_FULL";
pub const INVALID_ROOM: &str = "INVALID_ROOM";
pub const INVALID_SUBSCRIPTION: &str = "INVALID_SUBSCRIPTION";
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const DELIVERY_TIMEOUT: &str = "DELIVERY_TIMEOUT";
pub const BROKER_UNAVAILABLE: &str = "BROKER_UNAVAILABLE";
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const INTERNAL: &str = "INTERNAL";
