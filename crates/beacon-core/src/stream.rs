//! Metrics stream.
//!
//! Metric samples are buffered per organization and metric name and flushed
//! as `metric.update` events to the metric's room. While the arrival rate in
//! the current aggregation window stays at or below `max_update_frequency`,
//! a flush carries the raw points. Past that rate the buffer switches to a
//! running aggregate, so excess updates are coalesced instead of queued.

use async_trait::async_trait;
use beacon_protocol::{MetricKind, MetricSubscriptionOptions};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::component::Component;
use crate::error::EngineError;
use crate::event::{event_types, Event};
use crate::pool::SessionId;
use crate::publisher::EventPublisher;
use crate::room::metric_room;
use crate::unix_millis;

/// Maximum metric name length.
pub const MAX_METRIC_NAME_LENGTH: usize = 128;

/// Metrics stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Raw points held per metric before an early flush is triggered.
    pub buffer_size: usize,
    pub flush_interval: Duration,
    /// Emit raw points as `[value, timestamp]` pairs.
    pub compression: bool,
    /// Updates per aggregation window before coalescing.
    pub max_update_frequency: usize,
    pub aggregation_window: Duration,
    /// Idle buffers are dropped after this long.
    pub retention_period: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_secs(1),
            compression: false,
            max_update_frequency: 10,
            aggregation_window: Duration::from_secs(1),
            retention_period: Duration::from_secs(300),
        }
    }
}

/// One metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub organization_id: String,
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub tags: HashMap<String, String>,
    pub timestamp: u64,
}

impl MetricSample {
    /// A gauge sample taken now.
    #[must_use]
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            value,
            kind: MetricKind::Gauge,
            tags: HashMap::new(),
            timestamp: unix_millis(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Running aggregate over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub first_timestamp: u64,
    pub last_timestamp: u64,
}

impl Aggregate {
    fn of(value: f64, timestamp: u64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            last: value,
            first_timestamp: timestamp,
            last_timestamp: timestamp,
        }
    }

    fn add(&mut self, value: f64, timestamp: u64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        self.last_timestamp = timestamp;
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn to_json(self) -> serde_json::Value {
        json!({
            "count": self.count,
            "mean": self.mean(),
            "min": self.min,
            "max": self.max,
            "last": self.last,
            "firstTimestamp": self.first_timestamp,
            "lastTimestamp": self.last_timestamp,
        })
    }
}

fn fold(aggregate: &mut Option<Aggregate>, value: f64, timestamp: u64) {
    match aggregate {
        Some(agg) => agg.add(value, timestamp),
        None => *aggregate = Some(Aggregate::of(value, timestamp)),
    }
}

/// Real-time view of one metric.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub updated_at: u64,
}

/// Result of `subscribe_to_metric`.
#[derive(Debug, Clone)]
pub struct MetricSubscription {
    pub accepted: bool,
    pub room: String,
    pub snapshot: Option<MetricSnapshot>,
}

type MetricKey = (String, String);

#[derive(Debug)]
struct MetricBuffer {
    kind: MetricKind,
    tags: HashMap<String, String>,
    points: Vec<(f64, u64)>,
    coalesced: Option<Aggregate>,
    window_start: Instant,
    window_arrivals: usize,
    /// Aggregate of the current (or latest) window.
    window: Option<Aggregate>,
    last_update: Instant,
}

impl MetricBuffer {
    fn new(kind: MetricKind, now: Instant) -> Self {
        Self {
            kind,
            tags: HashMap::new(),
            points: Vec::new(),
            coalesced: None,
            window_start: now,
            window_arrivals: 0,
            window: None,
            last_update: now,
        }
    }

    fn is_dirty(&self) -> bool {
        !self.points.is_empty() || self.coalesced.is_some()
    }

    fn coalesce(&mut self) {
        for (value, timestamp) in self.points.drain(..) {
            fold(&mut self.coalesced, value, timestamp);
        }
    }
}

/// Metrics stream metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub buffers: usize,
    pub received: u64,
    pub coalesced: u64,
    pub flushes: u64,
    pub evicted: u64,
    pub subscriptions: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    coalesced: AtomicU64,
    flushes: AtomicU64,
    evicted: AtomicU64,
}

/// The metrics stream.
pub struct MetricsStream {
    publisher: Arc<EventPublisher>,
    config: StreamConfig,
    buffers: DashMap<MetricKey, MetricBuffer>,
    subscribers: DashMap<MetricKey, HashSet<SessionId>>,
    flush_seq: AtomicU64,
    buffer_full: Notify,
    counters: Counters,
    cancel: CancellationToken,
}

impl MetricsStream {
    /// Create a metrics stream flushing through `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<EventPublisher>, config: StreamConfig) -> Self {
        info!("Creating metrics stream with config: {:?}", config);
        Self {
            publisher,
            config,
            buffers: DashMap::new(),
            subscribers: DashMap::new(),
            flush_seq: AtomicU64::new(0),
            buffer_full: Notify::new(),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Buffer a metric sample.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` for an invalid name or a non-finite value.
    pub fn stream_metric(&self, sample: MetricSample) -> Result<(), EngineError> {
        validate_metric_name(&sample.name)?;
        if !sample.value.is_finite() {
            return Err(EngineError::InvalidMessage(format!(
                "metric {} has a non-finite value",
                sample.name
            )));
        }

        let now = Instant::now();
        let key = (sample.organization_id, sample.name);
        let mut buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| MetricBuffer::new(sample.kind, now));

        if now.duration_since(buffer.window_start) >= self.config.aggregation_window {
            buffer.window_start = now;
            buffer.window_arrivals = 0;
            buffer.window = None;
        }
        buffer.window_arrivals += 1;
        buffer.kind = sample.kind;
        buffer.last_update = now;
        if !sample.tags.is_empty() {
            buffer.tags = sample.tags;
        }
        fold(&mut buffer.window, sample.value, sample.timestamp);

        if buffer.window_arrivals > self.config.max_update_frequency {
            buffer.coalesce();
            fold(&mut buffer.coalesced, sample.value, sample.timestamp);
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        } else {
            buffer.points.push((sample.value, sample.timestamp));
            if buffer.points.len() >= self.config.buffer_size {
                self.buffer_full.notify_one();
            }
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Emit one `metric.update` event per dirty buffer and evict idle ones.
    ///
    /// Returns the number of events published.
    pub fn flush(&self) -> usize {
        let now = Instant::now();
        let mut pending: Vec<Event> = Vec::new();

        for mut entry in self.buffers.iter_mut() {
            if !entry.is_dirty() {
                continue;
            }
            let (organization_id, name) = entry.key().clone();
            let buffer = entry.value_mut();

            // Points that arrived after the window rolled over stay raw and
            // follow the aggregate of the earlier burst.
            let mut payloads = Vec::with_capacity(2);
            if let Some(aggregate) = buffer.coalesced.take() {
                payloads.push(json!({
                    "name": name,
                    "kind": buffer.kind,
                    "tags": buffer.tags,
                    "mode": "aggregate",
                    "aggregate": aggregate.to_json(),
                }));
            }
            if !buffer.points.is_empty() {
                let points: Vec<serde_json::Value> = buffer
                    .points
                    .drain(..)
                    .map(|(value, timestamp)| {
                        if self.config.compression {
                            json!([value, timestamp])
                        } else {
                            json!({ "value": value, "timestamp": timestamp })
                        }
                    })
                    .collect();
                payloads.push(json!({
                    "name": name,
                    "kind": buffer.kind,
                    "tags": buffer.tags,
                    "mode": "raw",
                    "points": points,
                }));
            }

            for payload in payloads {
                let seq = self.flush_seq.fetch_add(1, Ordering::Relaxed);
                pending.push(
                    Event::new(event_types::METRIC_UPDATE, organization_id.clone(), payload)
                        .with_room(metric_room(&organization_id, &name))
                        .with_dedup_key(format!("metric:{organization_id}:{name}:{seq}")),
                );
            }
        }

        let retention = self.config.retention_period;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, b| b.is_dirty() || now.duration_since(b.last_update) < retention);
        let evicted = before.saturating_sub(self.buffers.len());
        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            trace!(evicted, "Evicted idle metric buffers");
        }

        let mut published = 0;
        for event in pending {
            match self.publisher.publish(event) {
                Ok(outcome) if outcome.published => published += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "Dropping metric flush");
                    break;
                }
            }
        }
        if published > 0 {
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            debug!(events = published, "Flushed metric buffers");
        }
        published
    }

    /// Register interest in a metric.
    ///
    /// The caller joins the session to the returned room and subscribes it
    /// to `metric.update`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSubscription` for an invalid metric name.
    pub fn subscribe_to_metric(
        &self,
        organization_id: &str,
        name: &str,
        session_id: &str,
        options: &MetricSubscriptionOptions,
    ) -> Result<MetricSubscription, EngineError> {
        validate_metric_name(name)
            .map_err(|err| EngineError::InvalidSubscription(err.to_string()))?;

        self.subscribers
            .entry((organization_id.to_string(), name.to_string()))
            .or_default()
            .insert(session_id.to_string());

        let snapshot = if options.include_snapshot {
            self.snapshot(organization_id, name)
        } else {
            None
        };

        Ok(MetricSubscription {
            accepted: true,
            room: metric_room(organization_id, name),
            snapshot,
        })
    }

    /// Drop every metric interest of a session.
    pub fn unsubscribe_session(&self, session_id: &str) -> usize {
        let mut removed = 0;
        self.subscribers.retain(|_, sessions| {
            if sessions.remove(session_id) {
                removed += 1;
            }
            !sessions.is_empty()
        });
        removed
    }

    fn snapshot(&self, organization_id: &str, name: &str) -> Option<MetricSnapshot> {
        let buffer = self
            .buffers
            .get(&(organization_id.to_string(), name.to_string()))?;
        let window = buffer.window?;
        Some(MetricSnapshot {
            name: name.to_string(),
            kind: buffer.kind,
            count: window.count,
            mean: window.mean(),
            min: window.min,
            max: window.max,
            last: window.last,
            updated_at: window.last_timestamp,
        })
    }

    /// Windowed aggregates for every metric of an organization.
    #[must_use]
    pub fn get_real_time_metrics(&self, organization_id: &str) -> Vec<MetricSnapshot> {
        let names: Vec<String> = self
            .buffers
            .iter()
            .filter(|e| e.key().0 == organization_id)
            .map(|e| e.key().1.clone())
            .collect();

        let mut snapshots: Vec<_> = names
            .iter()
            .filter_map(|name| self.snapshot(organization_id, name))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Spawn the flush task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let stream = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stream.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = stream.buffer_full.notified() => {}
                }
                stream.flush();
            }
            debug!("Metrics flush task stopped");
        })
    }

    #[must_use]
    pub fn get_metrics(&self) -> StreamMetrics {
        StreamMetrics {
            buffers: self.buffers.len(),
            received: self.counters.received.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            subscriptions: self.subscribers.iter().map(|s| s.len()).sum(),
        }
    }
}

fn validate_metric_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_METRIC_NAME_LENGTH {
        return Err(EngineError::InvalidMessage(format!(
            "metric name must be 1-{MAX_METRIC_NAME_LENGTH} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
    {
        return Err(EngineError::InvalidMessage(format!(
            "metric name {name} contains invalid characters"
        )));
    }
    Ok(())
}

#[async_trait]
impl Component for MetricsStream {
    fn name(&self) -> &'static str {
        "metrics_stream"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let flushed = self.flush();
        self.buffers.clear();
        self.subscribers.clear();
        info!(flushed, "Metrics stream shut down");
        Ok(())
    }
}
