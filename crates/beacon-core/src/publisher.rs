//! Event publisher.
//!
//! `publish` only deduplicates and buffers; the network flush runs on the
//! batch task. Batches are keyed by target room and flushed in arrival order,
//! so events from one source reach the broker in the order they were
//! published. Failed flushes are retried with exponential backoff, and events
//! that exhaust their retries land in the dead-letter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::{Broker, EVENTS_TOPIC};
use crate::component::Component;
use crate::deadletter::{DeadLetter, DeadLetterStore};
use crate::error::EngineError;
use crate::event::{Event, EventId};
use crate::health::ServiceHealth;

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Pending events that trigger an early flush.
    pub batch_size: usize,
    /// Maximum time an event waits in a batch.
    pub batch_interval: Duration,
    /// Retries per failed flush before dead-lettering.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Repeat events with the same dedup key are suppressed for this long.
    pub dedup_window: Duration,
    /// How long dead letters are kept.
    pub dead_letter_retention: Duration,
    /// Dead-letter store capacity.
    pub dead_letter_capacity: usize,
    /// Broker topic.
    pub topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval: Duration::from_millis(100),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            dedup_window: Duration::from_secs(5),
            dead_letter_retention: Duration::from_secs(24 * 60 * 60),
            dead_letter_capacity: 10_000,
            topic: EVENTS_TOPIC.to_string(),
        }
    }
}

/// Exponential backoff: `min(max, base * 2^attempt)`.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub event_id: EventId,
    pub published: bool,
    pub deduped: bool,
}

/// Publisher metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherMetrics {
    pub published: u64,
    pub deduped: u64,
    pub flushed: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub dead_letters: usize,
    pub pending: usize,
    pub dedup_keys: usize,
}

#[derive(Default)]
struct Batches {
    order: Vec<String>,
    by_room: HashMap<String, Vec<Arc<Event>>>,
    pending: usize,
}

impl Batches {
    fn push(&mut self, event: Arc<Event>) {
        if !self.by_room.contains_key(&event.room) {
            self.order.push(event.room.clone());
        }
        self.by_room
            .entry(event.room.clone())
            .or_default()
            .push(event);
        self.pending += 1;
    }

    fn take(&mut self) -> Vec<(String, Vec<Arc<Event>>)> {
        let mut by_room = std::mem::take(&mut self.by_room);
        self.pending = 0;
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|room| by_room.remove(&room).map(|events| (room, events)))
            .collect()
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    deduped: AtomicU64,
    flushed: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

/// The event publisher.
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
    /// Dedup key -> first seen.
    seen: DashMap<String, Instant>,
    batches: Mutex<Batches>,
    /// Serializes flushes so batches reach the broker in FIFO order.
    flush_gate: tokio::sync::Mutex<()>,
    batch_full: Notify,
    dead_letters: DeadLetterStore,
    counters: Counters,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl EventPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: PublisherConfig) -> Self {
        info!(broker = broker.name(), "Creating event publisher with config: {:?}", config);
        Self {
            dead_letters: DeadLetterStore::new(
                config.dead_letter_retention,
                config.dead_letter_capacity,
            ),
            broker,
            config,
            seen: DashMap::new(),
            batches: Mutex::new(Batches::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            batch_full: Notify::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Accept an event for publication.
    ///
    /// Never waits on the broker. An event whose dedup key was first seen
    /// within the dedup window is reported as `deduped` and dropped.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once the publisher has been shut down.
    pub fn publish(&self, event: Event) -> Result<PublishOutcome, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let now = Instant::now();
        let fresh = match self.seen.entry(event.dedup_key.clone()) {
            Entry::Occupied(mut first_seen) => {
                if now.duration_since(*first_seen.get()) < self.config.dedup_window {
                    false
                } else {
                    first_seen.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if !fresh {
            self.counters.deduped.fetch_add(1, Ordering::Relaxed);
            trace!(event = %event.id, key = %event.dedup_key, "Deduplicated event");
            return Ok(PublishOutcome {
                event_id: event.id,
                published: false,
                deduped: true,
            });
        }

        let event_id = event.id.clone();
        let pending = {
            let mut batches = self.batches.lock();
            batches.push(Arc::new(event));
            batches.pending
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if pending >= self.config.batch_size {
            self.batch_full.notify_one();
        }

        Ok(PublishOutcome {
            event_id,
            published: true,
            deduped: false,
        })
    }

    /// Flush every pending batch to the broker.
    ///
    /// Returns the number of events the broker accepted.
    pub async fn flush(&self) -> usize {
        // Held through retries and their backoff: a later flush must not
        // overtake a batch that is still waiting on the broker.
        let _gate = self.flush_gate.lock().await;
        let batches = self.batches.lock().take();

        let mut accepted = 0;
        for (room, events) in batches {
            accepted += self.flush_room(&room, events).await;
        }
        if accepted > 0 {
            self.counters
                .flushed
                .fetch_add(accepted as u64, Ordering::Relaxed);
        }
        accepted
    }

    async fn flush_room(&self, room: &str, events: Vec<Arc<Event>>) -> usize {
        let mut index = 0;
        let mut attempt = 0u32;

        while index < events.len() {
            match self
                .broker
                .publish(&self.config.topic, Arc::clone(&events[index]))
                .await
            {
                Ok(()) => {
                    index += 1;
                    attempt = 0;
                }
                Err(err) if attempt < self.config.max_retries => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                    );
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        room = %room,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let remaining = &events[index..];
                    for event in remaining {
                        self.dead_letters
                            .push(Arc::clone(event), err.to_string(), attempt + 1);
                    }
                    self.counters
                        .dead_lettered
                        .fetch_add(remaining.len() as u64, Ordering::Relaxed);
                    error!(
                        room = %room,
                        events = remaining.len(),
                        attempts = attempt + 1,
                        error = %err,
                        "Retries exhausted, events moved to dead-letter store"
                    );
                    break;
                }
            }
        }

        index
    }

    /// Drop dedup keys and dead letters that have aged out.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.dedup_window;
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < window);
        let pruned = self.dead_letters.prune();
        if pruned > 0 {
            debug!(pruned, "Pruned dead letters");
        }
    }

    /// Spawn the batch task. It flushes on the batch interval or when a batch
    /// fills, whichever comes first, and flushes once more on shutdown.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(publisher.config.batch_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = publisher.batch_full.notified() => {}
                }
                publisher.flush().await;
                publisher.prune();
            }
            publisher.flush().await;
            debug!("Publisher batch task stopped");
        })
    }

    /// Dead letters currently retained.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot()
    }

    /// Events waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batches.lock().pending
    }

    #[must_use]
    pub fn get_metrics(&self) -> PublisherMetrics {
        PublisherMetrics {
            published: self.counters.published.load(Ordering::Relaxed),
            deduped: self.counters.deduped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.len(),
            pending: self.pending(),
            dedup_keys: self.seen.len(),
        }
    }
}

#[async_trait]
impl Component for EventPublisher {
    fn name(&self) -> &'static str {
        "event_publisher"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    fn health(&self) -> ServiceHealth {
        if !self.broker.is_healthy() {
            return ServiceHealth::unhealthy(
                self.name(),
                vec![format!("broker {} is unavailable", self.broker.name())],
            );
        }
        let dead = self.dead_letters.len();
        if dead > 0 {
            return ServiceHealth::degraded(
                self.name(),
                vec![format!("{dead} events in dead-letter store")],
            );
        }
        ServiceHealth::healthy(self.name())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let before = self.counters.dead_lettered.load(Ordering::Relaxed);
        let flushed = self.flush().await;
        let lost = self.counters.dead_lettered.load(Ordering::Relaxed) - before;

        info!(flushed, "Event publisher shut down");
        if lost > 0 {
            return Err(EngineError::BrokerUnavailable(format!(
                "{lost} events dead-lettered during final flush"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, LocalBroker};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::broadcast;

    /// Fails the first `failures` publishes, then delegates.
    struct FlakyBroker {
        inner: LocalBroker,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyBroker {
        fn new(failures: u32) -> Self {
            Self {
                inner: LocalBroker::default(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, topic: &str, event: Arc<Event>) -> Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BrokerError::Unavailable("injected".into()));
            }
            self.inner.publish(topic, event).await
        }

        async fn subscribe(
            &self,
            topic: &str,
        ) -> Result<broadcast::Receiver<Arc<Event>>, BrokerError> {
            self.inner.subscribe(topic).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    fn setup(failures: u32) -> (Arc<FlakyBroker>, EventPublisher) {
        let broker = Arc::new(FlakyBroker::new(failures));
        let publisher = EventPublisher::new(broker.clone(), PublisherConfig::default());
        (broker, publisher)
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_within_window() {
        let (broker, publisher) = setup(0);
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();

        let first = publisher
            .publish(Event::new("metric.update", "acme", json!({"v": 1})))
            .unwrap();
        let second = publisher
            .publish(Event::new("metric.update", "acme", json!({"v": 1})))
            .unwrap();
        assert!(first.published);
        assert!(second.deduped);

        publisher.flush().await;
        assert_eq!(drain(&mut rx).len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = publisher
            .publish(Event::new("metric.update", "acme", json!({"v": 1})))
            .unwrap();
        assert!(third.published);

        publisher.flush().await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_does_not_touch_broker() {
        let (broker, publisher) = setup(0);
        publisher
            .publish(Event::new("system.notice", "acme", json!({})))
            .unwrap();

        assert_eq!(broker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.pending(), 1);

        assert_eq!(publisher.flush().await, 1);
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order_per_room() {
        let (broker, publisher) = setup(0);
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();

        let ids: Vec<_> = (0..10)
            .map(|i| {
                let room = if i % 2 == 0 { "org:acme" } else { "dashboard:acme:ops" };
                publisher
                    .publish(Event::new("system.notice", "acme", json!({ "i": i })).with_room(room))
                    .unwrap()
                    .event_id
            })
            .collect();
        publisher.flush().await;

        let received = drain(&mut rx);
        for room in ["org:acme", "dashboard:acme:ops"] {
            let got: Vec<_> = received
                .iter()
                .filter(|e| e.room == room)
                .map(|e| e.id.clone())
                .collect();
            let want: Vec<_> = ids
                .iter()
                .enumerate()
                .filter(|(i, _)| (i % 2 == 0) == (room == "org:acme"))
                .map(|(_, id)| id.clone())
                .collect();
            assert_eq!(got, want);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let (broker, publisher) = setup(2);
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();

        publisher
            .publish(Event::new("system.notice", "acme", json!({})))
            .unwrap();
        assert_eq!(publisher.flush().await, 1);

        assert_eq!(drain(&mut rx).len(), 1);
        let metrics = publisher.get_metrics();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.dead_letters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_during_backoff_keeps_order() {
        let (broker, publisher) = setup(2);
        let publisher = Arc::new(publisher);
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();

        publisher
            .publish(Event::new("system.notice", "acme", json!({ "n": 1 })))
            .unwrap();
        let first = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.flush().await }
        });
        // The first flush takes its batch and starts backing off
        tokio::task::yield_now().await;
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);

        publisher
            .publish(Event::new("system.notice", "acme", json!({ "n": 2 })))
            .unwrap();
        assert_eq!(publisher.flush().await, 1);
        assert_eq!(first.await.unwrap(), 1);

        let order: Vec<u64> = drain(&mut rx)
            .iter()
            .map(|event| event.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(publisher.get_metrics().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_dead_letter() {
        let (broker, publisher) = setup(100);

        publisher
            .publish(Event::new("system.notice", "acme", json!({"a": 1})))
            .unwrap();
        publisher
            .publish(Event::new("system.notice", "acme", json!({"a": 2})))
            .unwrap();
        assert_eq!(publisher.flush().await, 0);

        // One initial attempt plus three retries
        assert_eq!(broker.calls.load(Ordering::SeqCst), 4);
        let dead = publisher.dead_letters();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].attempts, 4);
        assert_eq!(
            publisher.health().status,
            crate::health::HealthStatus::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_task_flushes_on_interval() {
        let broker = Arc::new(LocalBroker::default());
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();
        let publisher = Arc::new(EventPublisher::new(broker, PublisherConfig::default()));
        let task = publisher.start();

        publisher
            .publish(Event::new("system.notice", "acme", json!({})))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "system.notice");

        publisher.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_task_flushes_when_full() {
        let broker = Arc::new(LocalBroker::default());
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();
        let publisher = Arc::new(EventPublisher::new(
            broker,
            PublisherConfig {
                batch_size: 3,
                batch_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ));
        let task = publisher.start();
        // Let the first immediate tick pass
        tokio::task::yield_now().await;

        for i in 0..3 {
            publisher
                .publish(Event::new("system.notice", "acme", json!({ "i": i })))
                .unwrap();
        }

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        publisher.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_shutdown() {
        let (_broker, publisher) = setup(0);
        publisher.shutdown().await.unwrap();

        assert_eq!(
            publisher.publish(Event::new("system.notice", "acme", json!({}))),
            Err(EngineError::ShuttingDown)
        );
    }
}
