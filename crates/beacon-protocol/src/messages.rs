//! Message types for the Beacon protocol.
//!
//! Every message is an adjacently tagged object: `{"type": "...", "data": {...}}`.
//! The same shape is used for the JSON text encoding and the MessagePack
//! binary encoding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Inbound message type identifiers, used as dispatch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    JoinRoom,
    LeaveRoom,
    SubscribeEvents,
    SubscribeMetrics,
    SetPresenceStatus,
    GetActivityFeed,
    CollaborateDashboard,
    PublishMetric,
    Heartbeat,
    Disconnect,
}

impl MessageType {
    /// All inbound message types.
    pub const ALL: [MessageType; 10] = [
        MessageType::JoinRoom,
        MessageType::LeaveRoom,
        MessageType::SubscribeEvents,
        MessageType::SubscribeMetrics,
        MessageType::SetPresenceStatus,
        MessageType::GetActivityFeed,
        MessageType::CollaborateDashboard,
        MessageType::PublishMetric,
        MessageType::Heartbeat,
        MessageType::Disconnect,
    ];

    /// Wire name of the message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::JoinRoom => "join_room",
            MessageType::LeaveRoom => "leave_room",
            MessageType::SubscribeEvents => "subscribe_events",
            MessageType::SubscribeMetrics => "subscribe_metrics",
            MessageType::SetPresenceStatus => "set_presence_status",
            MessageType::GetActivityFeed => "get_activity_feed",
            MessageType::CollaborateDashboard => "collaborate_dashboard",
            MessageType::PublishMetric => "publish_metric",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a published metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Histogram,
    Timer,
}

/// Options for `subscribe_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSubscriptionOptions {
    /// Include the current windowed aggregate in the subscription result.
    #[serde(default)]
    pub include_snapshot: bool,
}

/// Filters for `get_activity_feed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityFilters {
    /// Only activity performed by this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Only activity with this action name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room.
    JoinRoom {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permissions: Option<Vec<String>>,
    },

    /// Leave a room.
    LeaveRoom { room: String },

    /// Register interest in event types, optionally scoped to rooms.
    #[serde(rename_all = "camelCase")]
    SubscribeEvents {
        #[serde(default)]
        event_types: Vec<String>,
        #[serde(default)]
        rooms: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<serde_json::Value>,
    },

    /// Register interest in a metric stream.
    #[serde(rename_all = "camelCase")]
    SubscribeMetrics {
        metric_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<MetricSubscriptionOptions>,
    },

    /// Set an explicit presence status.
    #[serde(rename_all = "camelCase")]
    SetPresenceStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_message: Option<String>,
    },

    /// Query the organization activity feed.
    GetActivityFeed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<ActivityFilters>,
    },

    /// Broadcast a collaboration signal to a dashboard room.
    #[serde(rename_all = "camelCase")]
    CollaborateDashboard {
        dashboard_id: String,
        action: String,
        #[serde(default)]
        collaborative_data: serde_json::Value,
    },

    /// Publish a metric value.
    PublishMetric {
        name: String,
        value: f64,
        #[serde(rename = "type", default)]
        kind: MetricKind,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        tags: HashMap<String, String>,
    },

    /// Liveness and activity heartbeat.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Client-initiated disconnect.
    Disconnect {
        #[serde(default)]
        reason: String,
    },
}

impl ClientMessage {
    /// Get the message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::JoinRoom { .. } => MessageType::JoinRoom,
            ClientMessage::LeaveRoom { .. } => MessageType::LeaveRoom,
            ClientMessage::SubscribeEvents { .. } => MessageType::SubscribeEvents,
            ClientMessage::SubscribeMetrics { .. } => MessageType::SubscribeMetrics,
            ClientMessage::SetPresenceStatus { .. } => MessageType::SetPresenceStatus,
            ClientMessage::GetActivityFeed { .. } => MessageType::GetActivityFeed,
            ClientMessage::CollaborateDashboard { .. } => MessageType::CollaborateDashboard,
            ClientMessage::PublishMetric { .. } => MessageType::PublishMetric,
            ClientMessage::Heartbeat { .. } => MessageType::Heartbeat,
            ClientMessage::Disconnect { .. } => MessageType::Disconnect,
        }
    }

    /// Create a `join_room` message.
    #[must_use]
    pub fn join_room(room: impl Into<String>) -> Self {
        ClientMessage::JoinRoom {
            room: room.into(),
            permissions: None,
        }
    }

    /// Create a `leave_room` message.
    #[must_use]
    pub fn leave_room(room: impl Into<String>) -> Self {
        ClientMessage::LeaveRoom { room: room.into() }
    }

    /// Create a `subscribe_events` message without a filter.
    #[must_use]
    pub fn subscribe_events(event_types: Vec<String>, rooms: Vec<String>) -> Self {
        ClientMessage::SubscribeEvents {
            event_types,
            rooms,
            filters: None,
        }
    }

    /// Create a gauge `publish_metric` message.
    #[must_use]
    pub fn publish_metric(name: impl Into<String>, value: f64) -> Self {
        ClientMessage::PublishMetric {
            name: name.into(),
            value,
            kind: MetricKind::Gauge,
            tags: HashMap::new(),
        }
    }

    /// Create a `heartbeat` message.
    #[must_use]
    pub fn heartbeat() -> Self {
        ClientMessage::Heartbeat { timestamp: None }
    }
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection established.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        user_id: String,
        organization_id: String,
        capabilities: Vec<String>,
        timestamp: u64,
    },

    /// Outcome of `join_room`.
    RoomJoinResult {
        room: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Confirmation of `leave_room`.
    RoomLeft { room: String },

    /// Outcome of `subscribe_events`.
    #[serde(rename_all = "camelCase")]
    SubscriptionResult {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        #[serde(default)]
        replayed: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Outcome of `subscribe_metrics`.
    #[serde(rename_all = "camelCase")]
    MetricsSubscriptionResult {
        metric_name: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Outcome of `set_presence_status`.
    PresenceStatusResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A page of the activity feed.
    #[serde(rename_all = "camelCase")]
    ActivityFeed {
        items: Vec<serde_json::Value>,
        total: usize,
        has_more: bool,
    },

    /// A delivered event.
    #[serde(rename_all = "camelCase")]
    Event {
        id: String,
        event_type: String,
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: serde_json::Value,
        timestamp: u64,
        #[serde(default)]
        replayed: bool,
    },

    /// Heartbeat response.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error affecting this session only.
    Error { code: String, message: String },

    /// The server is shutting down.
    ServerShutdown { message: String, timestamp: u64 },
}

impl ServerMessage {
    /// Wire name of the message.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::RoomJoinResult { .. } => "room_join_result",
            ServerMessage::RoomLeft { .. } => "room_left",
            ServerMessage::SubscriptionResult { .. } => "subscription_result",
            ServerMessage::MetricsSubscriptionResult { .. } => "metrics_subscription_result",
            ServerMessage::PresenceStatusResult { .. } => "presence_status_result",
            ServerMessage::ActivityFeed { .. } => "activity_feed",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ServerShutdown { .. } => "server_shutdown",
        }
    }

    /// Create an `error` message.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a `server_shutdown` message.
    #[must_use]
    pub fn server_shutdown(message: impl Into<String>, timestamp: u64) -> Self {
        ServerMessage::ServerShutdown {
            message: message.into(),
            timestamp,
        }
    }

    /// Create a successful `room_join_result`.
    #[must_use]
    pub fn room_joined(room: impl Into<String>) -> Self {
        ServerMessage::RoomJoinResult {
            room: room.into(),
            success: true,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type() {
        assert_eq!(
            ClientMessage::join_room("org:acme").message_type(),
            MessageType::JoinRoom
        );
        assert_eq!(
            ClientMessage::heartbeat().message_type(),
            MessageType::Heartbeat
        );
        assert_eq!(MessageType::SubscribeEvents.as_str(), "subscribe_events");
    }

    #[test]
    fn test_client_message_wire_shape() {
        let raw = json!({
            "type": "subscribe_events",
            "data": {
                "eventTypes": ["presence.changed"],
                "rooms": ["org:acme"],
                "filters": {"userId": "u-1"}
            }
        });

        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        match message {
            ClientMessage::SubscribeEvents {
                event_types,
                rooms,
                filters,
            } => {
                assert_eq!(event_types, vec!["presence.changed".to_string()]);
                assert_eq!(rooms, vec!["org:acme".to_string()]);
                assert_eq!(filters, Some(json!({"userId": "u-1"})));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_publish_metric_type_field() {
        let raw = json!({
            "type": "publish_metric",
            "data": {"name": "cpu", "value": 0.5, "type": "counter"}
        });

        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message,
            ClientMessage::PublishMetric {
                name: "cpu".to_string(),
                value: 0.5,
                kind: MetricKind::Counter,
                tags: HashMap::new(),
            }
        );
    }

    #[test]
    fn test_server_message_shape() {
        let message = ServerMessage::error("ROOM_FULL", "room is full");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "ROOM_FULL");
        assert_eq!(message.name(), "error");
    }
}
