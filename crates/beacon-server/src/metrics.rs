//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::engine::Engine;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "beacon_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const LATENCY_SECONDS: &str = "beacon_message_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
    pub const ROOMS_ACTIVE: &str = "beacon_rooms_active";
    pub const ROOM_MEMBERSHIPS: &str = "beacon_room_memberships";
    pub const EVENTS_PUBLISHED: &str = "beacon_events_published_total";
    pub const EVENTS_DEDUPED: &str = "beacon_events_deduped_total";
    pub const EVENTS_PENDING: &str = "beacon_events_pending";
    pub const PUBLISH_RETRIES: &str = "beacon_publish_retries_total";
    pub const DEAD_LETTERS: &str = "beacon_dead_letters";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "beacon_subscriptions_active";
    pub const DELIVERIES_TOTAL: &str = "beacon_deliveries_total";
    pub const DELIVERIES_FAILED: &str = "beacon_deliveries_failed_total";
    pub const DELIVERIES_TIMED_OUT: &str = "beacon_deliveries_timed_out_total";
    pub const EVENTS_REPLAYED: &str = "beacon_events_replayed_total";
    pub const METRIC_BUFFERS: &str = "beacon_metric_buffers";
    pub const METRIC_POINTS_COALESCED: &str = "beacon_metric_points_coalesced_total";
    pub const PRESENCE_USERS: &str = "beacon_presence_users";
    pub const ACTIVITY_RECORDS: &str = "beacon_activity_records";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused by the pool caps"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Inbound messages by type");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors reported to clients by code");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_counter!(names::EVENTS_PUBLISHED, "Events accepted by the publisher");
    metrics::describe_counter!(names::EVENTS_DEDUPED, "Events suppressed by deduplication");
    metrics::describe_gauge!(names::DEAD_LETTERS, "Events held in the dead-letter store");
    metrics::describe_counter!(
        names::DELIVERIES_FAILED,
        "Session deliveries that failed or timed out"
    );
    metrics::describe_gauge!(names::PRESENCE_USERS, "Tracked users by presence status");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an inbound message.
pub fn record_message(message_type: &'static str) {
    counter!(names::MESSAGES_TOTAL, "type" => message_type).increment(1);
}

/// Record message handling latency.
pub fn record_latency(message_type: &'static str, seconds: f64) {
    histogram!(names::LATENCY_SECONDS, "type" => message_type).record(seconds);
}

/// Record an error sent to a client.
pub fn record_error(code: &str) {
    counter!(names::ERRORS_TOTAL, "code" => code.to_string()).increment(1);
}

/// Copy component metrics into the exporter.
pub fn record_engine(engine: &Engine) {
    counter!(names::CONNECTIONS_REJECTED).absolute(engine.pool.get_metrics().rejected);

    let rooms = engine.rooms.stats();
    gauge!(names::ROOMS_ACTIVE).set(rooms.room_count as f64);
    gauge!(names::ROOM_MEMBERSHIPS).set(rooms.total_memberships as f64);

    let publisher = engine.publisher.get_metrics();
    counter!(names::EVENTS_PUBLISHED).absolute(publisher.published);
    counter!(names::EVENTS_DEDUPED).absolute(publisher.deduped);
    counter!(names::PUBLISH_RETRIES).absolute(publisher.retries);
    gauge!(names::EVENTS_PENDING).set(publisher.pending as f64);
    gauge!(names::DEAD_LETTERS).set(publisher.dead_letters as f64);

    let subscriber = engine.subscriber.get_metrics();
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(subscriber.subscriptions as f64);
    counter!(names::DELIVERIES_TOTAL).absolute(subscriber.delivered);
    counter!(names::DELIVERIES_FAILED).absolute(subscriber.failed);
    counter!(names::DELIVERIES_TIMED_OUT).absolute(subscriber.timed_out);
    counter!(names::EVENTS_REPLAYED).absolute(subscriber.replayed);

    let stream = engine.stream.get_metrics();
    gauge!(names::METRIC_BUFFERS).set(stream.buffers as f64);
    counter!(names::METRIC_POINTS_COALESCED).absolute(stream.coalesced);

    let presence = engine.presence.get_metrics();
    for (status, count) in [
        ("online", presence.online),
        ("idle", presence.idle),
        ("away", presence.away),
        ("busy", presence.busy),
        ("offline", presence.offline),
    ] {
        gauge!(names::PRESENCE_USERS, "status" => status).set(count as f64);
    }

    gauge!(names::ACTIVITY_RECORDS).set(engine.activity.get_metrics().records as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
