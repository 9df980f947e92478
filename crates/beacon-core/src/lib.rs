//! # beacon-core
//!
//! Event distribution and presence engine for Beacon.
//!
//! This crate holds the engine components. None of them perform network I/O
//! of their own; the broker adapter and the session senders are the only
//! suspension points.
//!
//! - **Pool** - Admits and tracks live sessions under concurrency caps
//! - **Rooms** - Scoped broadcast groups with TTL cleanup
//! - **Publisher** - Dedup, batching, retry and dead-lettering
//! - **Subscriber** - Filtered fan-out with delivery timeouts and replay
//! - **Stream** - Metric buffering with coalescing under load
//! - **Presence** - The online/idle/away/offline ladder
//! - **Activity** - Ranked organization feeds
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Presence   │────▶│  Publisher  │────▶│   Broker    │
//! │  Stream     │     └─────────────┘     └──────┬──────┘
//! │  Activity   │                                │
//! └─────────────┘                                ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Pool     │◀────│    Rooms    │◀────│ Subscriber  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod activity;
pub mod broker;
pub mod component;
pub mod deadletter;
pub mod error;
pub mod event;
pub mod health;
pub mod identity;
pub mod pool;
pub mod presence;
pub mod publisher;
pub mod replay;
pub mod room;
pub mod stream;
pub mod subscriber;

pub use activity::{ActivityConfig, ActivityFeed, ActivityRecord, FeedPage};
pub use broker::{Broker, BrokerError, LocalBroker, EVENTS_TOPIC};
pub use component::Component;
pub use error::{CapacityLimit, EngineError};
pub use event::{event_types, Event};
pub use health::{HealthRegistry, HealthStatus, ServiceHealth};
pub use identity::{Authenticator, Principal, Role, StaticTokenAuthenticator};
pub use pool::{ConnectionPool, PoolConfig, Session, SessionId};
pub use presence::{PresenceConfig, PresenceManager, PresenceStatus};
pub use publisher::{EventPublisher, PublisherConfig};
pub use room::{RoomConfig, RoomManager, RoomPolicy, RoomScope, OrganizationPolicy};
pub use stream::{MetricSample, MetricsStream, StreamConfig};
pub use subscriber::{EventSubscriber, SubscriberConfig, SubscriptionRequest};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
