//! Domain events carried through the broker.

use beacon_protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::room::organization_room;
use crate::unix_millis;

/// Well-known event types.
pub mod event_types {
    pub const PRESENCE_CHANGED: &str = "presence.changed";
    pub const METRIC_UPDATE: &str = "metric.update";
    pub const ACTIVITY_RECORDED: &str = "activity.recorded";
    pub const DASHBOARD_COLLABORATION: &str = "dashboard.collaboration";
    pub const MEMBER_JOINED: &str = "room.member_joined";
    pub const MEMBER_LEFT: &str = "room.member_left";
    pub const SYSTEM_NOTICE: &str = "system.notice";
}

/// An event id.
pub type EventId = String;

/// An immutable domain event.
///
/// Events are shared as `Arc<Event>` once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Target room; defaults to the organization room.
    pub room: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
    pub dedup_key: String,
}

impl Event {
    /// Create an event addressed to the organization room.
    ///
    /// The dedup key is derived from the type, organization and payload.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        organization_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let event_type = event_type.into();
        let organization_id = organization_id.into();
        let dedup_key = content_key(&event_type, &organization_id, &payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room: organization_room(&organization_id),
            event_type,
            organization_id,
            user_id: None,
            payload,
            timestamp: unix_millis(),
            dedup_key,
        }
    }

    /// Set the originating user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the target room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Replace the derived dedup key with an explicit one.
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    /// Build the outbound `event` message.
    #[must_use]
    pub fn to_server_message(&self, replayed: bool) -> ServerMessage {
        ServerMessage::Event {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            room: self.room.clone(),
            user_id: self.user_id.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            replayed,
        }
    }
}

/// Content-derived dedup key: SHA-256 over type, organization and payload.
#[must_use]
pub fn content_key(event_type: &str, organization_id: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update([0]);
    hasher.update(organization_id.as_bytes());
    hasher.update([0]);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
