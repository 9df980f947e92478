//! Server configuration.
//!
//! Configuration is layered from:
//! - A TOML file (`beacon.toml`, `/etc/beacon/beacon.toml` or
//!   `~/.config/beacon/beacon.toml`, first one found)
//! - Environment variables (`BEACON__SECTION__KEY`)
//!
//! Every field has a default, so an empty configuration is valid. Durations
//! are given in milliseconds.

use anyhow::{Context, Result};
use beacon_core::{
    ActivityConfig, PoolConfig, PresenceConfig, Principal, PublisherConfig, Role, RoomConfig,
    StaticTokenAuthenticator, StreamConfig, SubscriberConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::engine::{EngineConfig, EngineSettings};

const CONFIG_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub rooms: RoomSection,

    #[serde(default)]
    pub events: EventSection,

    #[serde(default)]
    pub streaming: StreamingSection,

    #[serde(default)]
    pub presence: PresenceSection,

    #[serde(default)]
    pub activity: ActivitySection,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    #[serde(default)]
    pub auth: AuthSection,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Path for WebSocket endpoint.
    pub websocket_path: String,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".to_string(),
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_connections: usize,
    pub max_connections_per_org: usize,
    pub max_connections_per_user: usize,
    pub idle_timeout_ms: u64,
    pub outbound_capacity: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_connections: pool.max_connections,
            max_connections_per_org: pool.max_connections_per_org,
            max_connections_per_user: pool.max_connections_per_user,
            idle_timeout_ms: millis(pool.idle_timeout),
            outbound_capacity: pool.outbound_capacity,
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            max_connections: section.max_connections,
            max_connections_per_org: section.max_connections_per_org,
            max_connections_per_user: section.max_connections_per_user,
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
            outbound_capacity: section.outbound_capacity,
        }
    }
}

/// Room table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSection {
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub default_capacity: Option<usize>,
    pub max_rooms: usize,
}

impl Default for RoomSection {
    fn default() -> Self {
        let rooms = RoomConfig::default();
        Self {
            ttl_ms: millis(rooms.ttl),
            sweep_interval_ms: millis(rooms.sweep_interval),
            default_capacity: rooms.default_capacity,
            max_rooms: rooms.max_rooms,
        }
    }
}

impl From<&RoomSection> for RoomConfig {
    fn from(section: &RoomSection) -> Self {
        Self {
            ttl: Duration::from_millis(section.ttl_ms),
            sweep_interval: Duration::from_millis(section.sweep_interval_ms),
            default_capacity: section.default_capacity,
            max_rooms: section.max_rooms,
        }
    }
}

/// Event publishing and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSection {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub dedup_window_ms: u64,
    pub dead_letter_retention_ms: u64,
    pub dead_letter_capacity: usize,
    pub history_retention_ms: u64,
    pub replay_buffer_size: usize,
    pub enable_replay: bool,
    pub delivery_timeout_ms: u64,
    pub subscription_ttl_ms: u64,
    pub max_subscriptions_per_session: usize,
    /// Capacity of the in-process broker's per-topic queue.
    pub broker_capacity: usize,
}

impl Default for EventSection {
    fn default() -> Self {
        let publisher = PublisherConfig::default();
        let subscriber = SubscriberConfig::default();
        Self {
            batch_size: publisher.batch_size,
            batch_interval_ms: millis(publisher.batch_interval),
            max_retries: publisher.max_retries,
            retry_base_delay_ms: millis(publisher.retry_base_delay),
            retry_max_delay_ms: millis(publisher.retry_max_delay),
            dedup_window_ms: millis(publisher.dedup_window),
            dead_letter_retention_ms: millis(publisher.dead_letter_retention),
            dead_letter_capacity: publisher.dead_letter_capacity,
            history_retention_ms: millis(subscriber.history_retention),
            replay_buffer_size: subscriber.replay_buffer_size,
            enable_replay: subscriber.enable_replay,
            delivery_timeout_ms: millis(subscriber.delivery_timeout),
            subscription_ttl_ms: millis(subscriber.subscription_ttl),
            max_subscriptions_per_session: subscriber.max_subscriptions_per_session,
            broker_capacity: 65_536,
        }
    }
}

impl EventSection {
    fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            batch_size: self.batch_size,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            dead_letter_retention: Duration::from_millis(self.dead_letter_retention_ms),
            dead_letter_capacity: self.dead_letter_capacity,
            ..PublisherConfig::default()
        }
    }

    fn subscriber(&self) -> SubscriberConfig {
        SubscriberConfig {
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            history_retention: Duration::from_millis(self.history_retention_ms),
            replay_buffer_size: self.replay_buffer_size,
            enable_replay: self.enable_replay,
            subscription_ttl: Duration::from_millis(self.subscription_ttl_ms),
            max_subscriptions_per_session: self.max_subscriptions_per_session,
            ..SubscriberConfig::default()
        }
    }
}

/// Metric streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
    pub compression: bool,
    pub max_update_frequency: usize,
    pub aggregation_window_ms: u64,
    pub retention_period_ms: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            buffer_size: stream.buffer_size,
            flush_interval_ms: millis(stream.flush_interval),
            compression: stream.compression,
            max_update_frequency: stream.max_update_frequency,
            aggregation_window_ms: millis(stream.aggregation_window),
            retention_period_ms: millis(stream.retention_period),
        }
    }
}

impl From<&StreamingSection> for StreamConfig {
    fn from(section: &StreamingSection) -> Self {
        Self {
            buffer_size: section.buffer_size,
            flush_interval: Duration::from_millis(section.flush_interval_ms),
            compression: section.compression,
            max_update_frequency: section.max_update_frequency,
            aggregation_window: Duration::from_millis(section.aggregation_window_ms),
            retention_period: Duration::from_millis(section.retention_period_ms),
        }
    }
}

/// Presence ladder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    pub idle_timeout_ms: u64,
    pub away_timeout_ms: u64,
    pub offline_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub history_size: usize,
    pub offline_retention_ms: u64,
}

impl Default for PresenceSection {
    fn default() -> Self {
        let presence = PresenceConfig::default();
        Self {
            idle_timeout_ms: millis(presence.idle_timeout),
            away_timeout_ms: millis(presence.away_timeout),
            offline_timeout_ms: millis(presence.offline_timeout),
            heartbeat_interval_ms: millis(presence.heartbeat_interval),
            history_size: presence.history_size,
            offline_retention_ms: millis(presence.offline_retention),
        }
    }
}

impl From<&PresenceSection> for PresenceConfig {
    fn from(section: &PresenceSection) -> Self {
        Self {
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
            away_timeout: Duration::from_millis(section.away_timeout_ms),
            offline_timeout: Duration::from_millis(section.offline_timeout_ms),
            heartbeat_interval: Duration::from_millis(section.heartbeat_interval_ms),
            history_size: section.history_size,
            offline_retention: Duration::from_millis(section.offline_retention_ms),
        }
    }
}

/// Activity feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
    pub max_feed_size: usize,
    pub relevance_threshold: f64,
    pub insights_period_ms: u64,
    pub recency_half_life_ms: u64,
}

impl Default for ActivitySection {
    fn default() -> Self {
        let activity = ActivityConfig::default();
        Self {
            max_feed_size: activity.max_feed_size,
            relevance_threshold: activity.relevance_threshold,
            insights_period_ms: millis(activity.insights_period),
            recency_half_life_ms: millis(activity.recency_half_life),
        }
    }
}

impl From<&ActivitySection> for ActivityConfig {
    fn from(section: &ActivitySection) -> Self {
        Self {
            max_feed_size: section.max_feed_size,
            relevance_threshold: section.relevance_threshold,
            insights_period: Duration::from_millis(section.insights_period_ms),
            recency_half_life: Duration::from_millis(section.recency_half_life_ms),
        }
    }
}

/// Orchestrator ticks and shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub health_check_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            health_check_interval_ms: millis(settings.health_check_interval),
            metrics_interval_ms: millis(settings.metrics_interval),
            shutdown_grace_ms: millis(settings.shutdown_grace),
            shutdown_timeout_ms: millis(settings.shutdown_timeout),
        }
    }
}

impl From<&EngineSection> for EngineSettings {
    fn from(section: &EngineSection) -> Self {
        Self {
            health_check_interval: Duration::from_millis(section.health_check_interval_ms),
            metrics_interval: Duration::from_millis(section.metrics_interval_ms),
            shutdown_grace: Duration::from_millis(section.shutdown_grace_ms),
            shutdown_timeout: Duration::from_millis(section.shutdown_timeout_ms),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Enable metrics export.
    pub enabled: bool,
    /// Metrics port.
    pub port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// Static token table for the built-in identity collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub tokens: Vec<TokenEntry>,
}

/// One accepted token and the principal it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AuthSection {
    /// Build the token authenticator.
    #[must_use]
    pub fn authenticator(&self) -> StaticTokenAuthenticator {
        let tokens: HashMap<String, Principal> = self
            .tokens
            .iter()
            .map(|entry| {
                let display = entry
                    .display_name
                    .clone()
                    .unwrap_or_else(|| entry.user_id.clone());
                let principal = Principal::new(
                    entry.user_id.clone(),
                    entry.organization_id.clone(),
                    entry.role,
                    display,
                );
                (entry.token.clone(), principal)
            })
            .collect();
        StaticTokenAuthenticator::new(tokens)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportSection::default(),
            pool: PoolSection::default(),
            rooms: RoomSection::default(),
            events: EventSection::default(),
            streaming: StreamingSection::default(),
            presence: PresenceSection::default(),
            activity: ActivitySection::default(),
            engine: EngineSection::default(),
            metrics: MetricsSection::default(),
            auth: AuthSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value has the wrong
    /// type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                info!(path = %expanded, "Loading configuration file");
                builder = builder.add_source(::config::File::new(
                    expanded.as_ref(),
                    ::config::FileFormat::Toml,
                ));
                break;
            }
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("BEACON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Component configuration for the engine.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool: PoolConfig::from(&self.pool),
            rooms: RoomConfig::from(&self.rooms),
            publisher: self.events.publisher(),
            subscriber: self.events.subscriber(),
            stream: StreamConfig::from(&self.streaming),
            presence: PresenceConfig::from(&self.presence),
            activity: ActivityConfig::from(&self.activity),
            settings: EngineSettings::from(&self.engine),
        }
    }
}
