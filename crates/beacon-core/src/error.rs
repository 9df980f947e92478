//! Engine error taxonomy.

use beacon_protocol::codes;
use std::fmt;
use thiserror::Error;

use crate::broker::BrokerError;

/// Which concurrency cap rejected an admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Process-wide connection cap.
    Global,
    /// Per-organization cap.
    Organization(String),
    /// Per-user cap.
    User(String),
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityLimit::Global => f.write_str("global connection limit"),
            CapacityLimit::Organization(org) => write!(f, "connection limit for organization {org}"),
            CapacityLimit::User(user) => write!(f, "connection limit for user {user}"),
        }
    }
}

/// Errors raised by engine components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A concurrency cap has been reached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),

    /// The session id is already tracked.
    #[error("Session already connected: {0}")]
    DuplicateSession(String),

    /// The upstream policy denied the operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The room has reached its capacity.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// The room identifier is malformed.
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    /// The subscription request is malformed or not permitted.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// The inbound message is malformed for its type.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Delivery to a session did not complete in time.
    #[error("Delivery to session {0} timed out")]
    DeliveryTimeout(String),

    /// The broker rejected or could not accept a publish.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The session is not tracked (benign on teardown paths).
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The engine no longer accepts work.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Stable machine-readable code for client-facing `error` messages.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::CapacityExceeded(_) => codes::CAPACITY_EXCEEDED,
            EngineError::DuplicateSession(_) => codes::DUPLICATE_SESSION,
            EngineError::Unauthorized(_) => codes::UNAUTHORIZED,
            EngineError::RoomFull(_) => codes::ROOM_FULL,
            EngineError::InvalidRoom(_) => codes::INVALID_ROOM,
            EngineError::InvalidSubscription(_) => codes::INVALID_SUBSCRIPTION,
            EngineError::InvalidMessage(_) => codes::INVALID_MESSAGE,
            EngineError::DeliveryTimeout(_) => codes::DELIVERY_TIMEOUT,
            EngineError::BrokerUnavailable(_) => codes::BROKER_UNAVAILABLE,
            EngineError::SessionNotFound(_) => codes::SESSION_NOT_FOUND,
            EngineError::ShuttingDown => codes::SHUTTING_DOWN,
        }
    }

    /// Whether the error is a no-op on idempotent teardown paths.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, EngineError::SessionNotFound(_))
    }
}

impl From<BrokerError> for EngineError {
    fn from(err: BrokerError) -> Self {
        EngineError::BrokerUnavailable(err.to_string())
    }
}
