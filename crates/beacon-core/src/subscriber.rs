//! Event subscriber.
//!
//! Receives events from the broker and fans them out to local sessions whose
//! subscriptions match. A session only receives an event when it belongs to
//! the event's organization and is a member of the event's room.
//!
//! Fan-out never waits on a session. An event goes straight onto the
//! session's outbound queue; once that queue is full, the session's events
//! go through its own ordered backlog, drained by a per-session task where
//! each send is bounded by `delivery_timeout` and never retried. A stalled
//! session therefore neither reorders its own events nor delays anyone
//! else's. A session that reconnects within `history_retention` is
//! backfilled from the replay buffer when it subscribes; live events that
//! arrive during the backfill are held back and released after it, so the
//! two streams never interleave.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broker::Broker;
use crate::component::Component;
use crate::error::EngineError;
use crate::event::{Event, EventId};
use crate::pool::{ConnectionPool, DeliveryHandle, SessionId};
use crate::replay::ReplayBuffer;
use crate::room::{RoomId, RoomManager};

/// Matches every event type.
pub const ANY_EVENT_TYPE: &str = "*";

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Upper bound on a single delivery to a session.
    pub delivery_timeout: Duration,
    /// How long after a disconnect a returning user is backfilled.
    pub history_retention: Duration,
    /// Records kept per room, and the maximum replayed per subscribe.
    pub replay_buffer_size: usize,
    pub enable_replay: bool,
    /// Lifetime of a subscription without renewal.
    pub subscription_ttl: Duration,
    pub max_subscriptions_per_session: usize,
    /// Events a lagging session may have waiting behind its full outbound
    /// queue before further events to it are dropped.
    pub session_backlog: usize,
    /// Broker redeliveries of an event id within this window are dropped.
    pub seen_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(5),
            history_retention: Duration::from_secs(300),
            replay_buffer_size: 100,
            enable_replay: true,
            subscription_ttl: Duration::from_secs(3600),
            max_subscriptions_per_session: 50,
            session_backlog: 256,
            seen_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Arbitrary predicate applied after the type and room filters.
pub type FilterPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Build a predicate from a client filter object.
///
/// `userId` matches the originating user; every other key must equal the
/// payload field of the same name. `null` and `{}` mean no filter.
///
/// # Errors
///
/// Returns `InvalidSubscription` if the filter is not an object.
pub fn filter_from_json(
    filters: &serde_json::Value,
) -> Result<Option<FilterPredicate>, EngineError> {
    let object = match filters {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => return Ok(None),
        serde_json::Value::Object(map) => map.clone(),
        other => {
            return Err(EngineError::InvalidSubscription(format!(
                "filters must be an object, got {other}"
            )))
        }
    };

    Ok(Some(Arc::new(move |event: &Event| {
        object.iter().all(|(key, expected)| match key.as_str() {
            "userId" => event.user_id.as_deref() == expected.as_str(),
            _ => event.payload.get(key) == Some(expected),
        })
    })))
}

/// A subscribe request.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRequest {
    pub event_types: Vec<String>,
    /// Room filter; empty means every room the session has joined.
    pub rooms: Vec<RoomId>,
    pub filters: Option<serde_json::Value>,
}

/// A per-session interest in events.
pub struct Subscription {
    pub id: String,
    pub session_id: SessionId,
    pub organization_id: String,
    pub user_key: String,
    pub event_types: HashSet<String>,
    pub rooms: HashSet<RoomId>,
    filter: Option<FilterPredicate>,
    pub expires_at: Instant,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("event_types", &self.event_types)
            .field("rooms", &self.rooms)
            .field("filtered", &self.filter.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Subscription {
    /// Whether the event is wanted. Cheapest checks run first.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if event.organization_id != self.organization_id {
            return false;
        }
        if !self.event_types.contains(ANY_EVENT_TYPE)
            && !self.event_types.contains(&event.event_type)
        {
            return false;
        }
        if !self.rooms.is_empty() && !self.rooms.contains(&event.room) {
            return false;
        }
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn same_interest(&self, types: &HashSet<String>, rooms: &HashSet<RoomId>) -> bool {
        &self.event_types == types && &self.rooms == rooms
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscription_id: String,
    pub renewed: bool,
    /// Events backfilled from the replay buffer.
    pub replayed: usize,
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    /// Sessions with a full outbound queue; the event waits in their backlog.
    pub queued: usize,
    /// Sessions whose delivery was held back behind a backfill.
    pub deferred: usize,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Delivered,
    Queued,
    Failed,
    TimedOut,
    Cancelled,
}

/// Subscriber metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberMetrics {
    pub sessions: usize,
    pub subscriptions: usize,
    pub received: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub replayed: u64,
    pub replay_buffered: usize,
    /// Sessions currently draining a backlog.
    pub backlogged: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    replayed: AtomicU64,
}

/// The event subscriber.
pub struct EventSubscriber {
    pool: Arc<ConnectionPool>,
    rooms: Arc<RoomManager>,
    config: SubscriberConfig,
    subscriptions: DashMap<SessionId, Vec<Subscription>>,
    replay: ReplayBuffer,
    /// Event id -> first seen, for broker redeliveries.
    seen: DashMap<EventId, Instant>,
    /// User key -> last disconnect.
    disconnected: DashMap<String, Instant>,
    /// Live events held back while a session is being backfilled.
    gates: DashMap<SessionId, Vec<Arc<Event>>>,
    /// Rooms already backfilled per session.
    replayed_rooms: DashMap<SessionId, HashSet<RoomId>>,
    /// Ordered overflow for sessions whose outbound queue is full.
    backlogs: DashMap<SessionId, mpsc::Sender<Arc<Event>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl EventSubscriber {
    /// Create a subscriber.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, rooms: Arc<RoomManager>, config: SubscriberConfig) -> Self {
        info!("Creating event subscriber with config: {:?}", config);
        Self {
            replay: ReplayBuffer::new(config.replay_buffer_size, config.history_retention),
            pool,
            rooms,
            config,
            subscriptions: DashMap::new(),
            seen: DashMap::new(),
            disconnected: DashMap::new(),
            gates: DashMap::new(),
            replayed_rooms: DashMap::new(),
            backlogs: DashMap::new(),
            counters: Arc::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register (or renew) a subscription for a session.
    ///
    /// When the session's user disconnected within `history_retention`,
    /// missed events for the subscribed rooms are sent first.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown session and
    /// `InvalidSubscription` for a malformed request or a room the session
    /// has not joined.
    pub async fn subscribe(
        &self,
        session_id: &str,
        request: SubscriptionRequest,
    ) -> Result<SubscribeOutcome, EngineError> {
        let principal = self
            .pool
            .principal(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if request.event_types.is_empty() {
            return Err(EngineError::InvalidSubscription(
                "at least one event type is required".to_string(),
            ));
        }
        for room in &request.rooms {
            if !self.rooms.is_member(session_id, room) {
                return Err(EngineError::InvalidSubscription(format!(
                    "session has not joined {room}"
                )));
            }
        }
        let filter = match &request.filters {
            Some(filters) => filter_from_json(filters)?,
            None => None,
        };

        let event_types: HashSet<String> = request.event_types.into_iter().collect();
        let rooms: HashSet<RoomId> = request.rooms.into_iter().collect();
        let expires_at = Instant::now() + self.config.subscription_ttl;

        // Renewal
        {
            let mut subs = self.subscriptions.entry(session_id.to_string()).or_default();
            if let Some(existing) = subs
                .iter_mut()
                .find(|s| s.same_interest(&event_types, &rooms))
            {
                existing.expires_at = expires_at;
                existing.filter = filter;
                debug!(session = %session_id, subscription = %existing.id, "Renewed subscription");
                return Ok(SubscribeOutcome {
                    subscription_id: existing.id.clone(),
                    renewed: true,
                    replayed: 0,
                });
            }
            if subs.len() >= self.config.max_subscriptions_per_session {
                return Err(EngineError::InvalidSubscription(format!(
                    "subscription limit of {} reached",
                    self.config.max_subscriptions_per_session
                )));
            }
        }

        let replay_rooms = self.replay_rooms(session_id, &principal.user_key(), &rooms);
        if !replay_rooms.is_empty() {
            self.gates.entry(session_id.to_string()).or_default();
        }

        let subscription = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            organization_id: principal.organization_id.clone(),
            user_key: principal.user_key(),
            event_types,
            rooms,
            filter,
            expires_at,
        };
        let subscription_id = subscription.id.clone();

        let replay_events: Vec<Arc<Event>> = match self.disconnected.get(&principal.user_key()) {
            Some(since) if !replay_rooms.is_empty() => self
                .replay
                .since(&replay_rooms, *since, self.config.replay_buffer_size)
                .into_iter()
                .filter(|e| subscription.matches(e))
                .collect(),
            _ => Vec::new(),
        };

        self.subscriptions
            .entry(session_id.to_string())
            .or_default()
            .push(subscription);

        debug!(
            session = %session_id,
            subscription = %subscription_id,
            "Subscribed"
        );

        let replayed = if replay_rooms.is_empty() {
            0
        } else {
            self.replayed_rooms
                .entry(session_id.to_string())
                .or_default()
                .extend(replay_rooms.iter().cloned());
            self.backfill(session_id, replay_events).await
        };

        Ok(SubscribeOutcome {
            subscription_id,
            renewed: false,
            replayed,
        })
    }

    /// Rooms to backfill: requested (or joined) rooms not yet backfilled,
    /// for a user who disconnected within the retention window.
    fn replay_rooms(
        &self,
        session_id: &str,
        user_key: &str,
        requested: &HashSet<RoomId>,
    ) -> Vec<RoomId> {
        if !self.config.enable_replay {
            return Vec::new();
        }
        let recent = self
            .disconnected
            .get(user_key)
            .is_some_and(|at| at.elapsed() <= self.config.history_retention);
        if !recent {
            return Vec::new();
        }

        let candidates = if requested.is_empty() {
            self.rooms.rooms_for(session_id)
        } else {
            requested.iter().cloned().collect()
        };
        let done = self.replayed_rooms.get(session_id);
        candidates
            .into_iter()
            .filter(|room| done.as_ref().map_or(true, |d| !d.contains(room)))
            .collect()
    }

    /// Send replayed events, then release live events held behind them.
    async fn backfill(&self, session_id: &str, events: Vec<Arc<Event>>) -> usize {
        let Some(handle) = self.pool.delivery_handle(session_id) else {
            self.gates.remove(session_id);
            return 0;
        };

        let mut sent: HashSet<EventId> = HashSet::new();
        for event in events {
            if self.send_to(session_id, &handle, &event, true).await == SendOutcome::Delivered {
                sent.insert(event.id.clone());
            }
        }
        let replayed = sent.len();
        self.counters
            .replayed
            .fetch_add(replayed as u64, Ordering::Relaxed);

        loop {
            let held = self
                .gates
                .get_mut(session_id)
                .map(|mut held| std::mem::take(&mut *held))
                .unwrap_or_default();

            if held.is_empty() {
                if self
                    .gates
                    .remove_if(session_id, |_, held| held.is_empty())
                    .is_some()
                    || !self.gates.contains_key(session_id)
                {
                    break;
                }
                continue;
            }

            for event in held {
                if !sent.contains(&event.id) {
                    self.send_to(session_id, &handle, &event, false).await;
                }
            }
        }

        debug!(session = %session_id, replayed, "Backfill complete");
        replayed
    }

    /// Remove every subscription of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session had no subscriptions.
    pub fn unsubscribe(&self, session_id: &str) -> Result<usize, EngineError> {
        self.gates.remove(session_id);
        self.replayed_rooms.remove(session_id);
        // The backlog task finishes what is already queued, then exits.
        self.backlogs.remove(session_id);

        let (_, subs) = self
            .subscriptions
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if let Some(sub) = subs.first() {
            self.disconnected.insert(sub.user_key.clone(), Instant::now());
        }
        debug!(session = %session_id, count = subs.len(), "Unsubscribed");
        Ok(subs.len())
    }

    /// Fan an event out to matching local sessions.
    ///
    /// Never blocks: a session that cannot take the event right away gets it
    /// through its backlog, in order.
    pub fn deliver(&self, event: Arc<Event>) -> DeliveryReport {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let mut report = DeliveryReport::default();

        let now = Instant::now();
        let duplicate = match self.seen.entry(event.id.clone()) {
            Entry::Occupied(first_seen) => {
                now.duration_since(*first_seen.get()) < self.config.seen_window
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        };
        if duplicate {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            trace!(event = %event.id, "Dropped duplicate delivery");
            report.duplicate = true;
            return report;
        }

        if self.config.enable_replay {
            self.replay.record(Arc::clone(&event));
        }

        for session_id in self.rooms.members(&event.room) {
            let wanted = self.subscriptions.get(&session_id).is_some_and(|subs| {
                subs.iter()
                    .any(|s| !s.is_expired(now) && s.matches(&event))
            });
            if !wanted {
                continue;
            }
            let Some(handle) = self.pool.delivery_handle(&session_id) else {
                continue;
            };
            if handle.organization_id != event.organization_id {
                continue;
            }
            if let Some(mut held) = self.gates.get_mut(&session_id) {
                held.push(Arc::clone(&event));
                report.deferred += 1;
                continue;
            }
            match self.enqueue(&session_id, &handle, &event) {
                SendOutcome::Delivered => report.delivered += 1,
                SendOutcome::Queued => report.queued += 1,
                SendOutcome::Failed => report.failed += 1,
                SendOutcome::TimedOut | SendOutcome::Cancelled => {}
            }
        }

        trace!(
            event = %event.id,
            room = %event.room,
            delivered = report.delivered,
            queued = report.queued,
            failed = report.failed,
            "Fanned out event"
        );
        report
    }

    /// Hand one event to a session without waiting.
    fn enqueue(&self, session_id: &str, handle: &DeliveryHandle, event: &Arc<Event>) -> SendOutcome {
        if handle.cancel.is_cancelled() {
            return SendOutcome::Cancelled;
        }

        // Once a session has a backlog everything goes through it, so the
        // outbound queue never overtakes older events.
        if let Some(backlog) = self.backlogs.get(session_id) {
            return match backlog.try_send(Arc::clone(event)) {
                Ok(()) => SendOutcome::Queued,
                Err(TrySendError::Full(_)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %session_id,
                        event = %event.id,
                        backlog = self.config.session_backlog,
                        "Session backlog full, dropping event"
                    );
                    SendOutcome::Failed
                }
                Err(TrySendError::Closed(_)) => {
                    drop(backlog);
                    self.backlogs.remove(session_id);
                    SendOutcome::Cancelled
                }
            };
        }

        match handle.sender.try_send(event.to_server_message(false)) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Delivered
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(session = %session_id, event = %event.id, "Delivery failed: session closed");
                SendOutcome::Failed
            }
            Err(TrySendError::Full(_)) => {
                let backlog = self
                    .backlogs
                    .entry(session_id.to_string())
                    .or_insert_with(|| self.spawn_backlog(session_id, handle.clone()))
                    .clone();
                debug!(session = %session_id, "Outbound queue full, session is backlogged");
                match backlog.try_send(Arc::clone(event)) {
                    Ok(()) => SendOutcome::Queued,
                    Err(_) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        SendOutcome::Failed
                    }
                }
            }
        }
    }

    /// Spawn the task that drains a session's backlog in arrival order.
    fn spawn_backlog(&self, session_id: &str, handle: DeliveryHandle) -> mpsc::Sender<Arc<Event>> {
        let (backlog, mut queued) = mpsc::channel::<Arc<Event>>(self.config.session_backlog.max(1));
        let counters = Arc::clone(&self.counters);
        let delivery_timeout = self.config.delivery_timeout;
        let shutdown = self.cancel.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = queued.recv() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };
                let outcome =
                    send_event(&counters, delivery_timeout, &session_id, &handle, &event, false)
                        .await;
                if outcome == SendOutcome::Cancelled {
                    break;
                }
            }
            trace!(session = %session_id, "Session backlog closed");
        });
        backlog
    }

    async fn send_to(
        &self,
        session_id: &str,
        handle: &DeliveryHandle,
        event: &Event,
        replayed: bool,
    ) -> SendOutcome {
        send_event(
            &self.counters,
            self.config.delivery_timeout,
            session_id,
            handle,
            event,
            replayed,
        )
        .await
    }

    /// Expire subscriptions and age out dedup, disconnect and replay state.
    pub fn sweep(&self) {
        let now = Instant::now();

        let mut expired = 0;
        self.subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| !s.is_expired(now));
            expired += before - subs.len();
            !subs.is_empty()
        });
        if expired > 0 {
            debug!(expired, "Expired subscriptions");
        }

        let seen_window = self.config.seen_window;
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < seen_window);

        let retention = self.config.history_retention;
        self.disconnected
            .retain(|_, at| now.duration_since(*at) <= retention);

        self.backlogs.retain(|_, backlog| !backlog.is_closed());
        self.replay.prune();
    }

    /// Attach to the broker and spawn the delivery and sweep tasks.
    ///
    /// # Errors
    ///
    /// Returns `BrokerUnavailable` if the broker subscription fails.
    pub async fn start(
        self: &Arc<Self>,
        broker: Arc<dyn Broker>,
        topic: &str,
    ) -> Result<Vec<JoinHandle<()>>, EngineError> {
        let mut receiver = broker.subscribe(topic).await?;
        info!(broker = broker.name(), topic = %topic, "Event subscriber attached");

        let subscriber = Arc::clone(self);
        let cancel = self.cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            subscriber.deliver(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event subscriber lagged behind broker");
                        }
                        Err(RecvError::Closed) => {
                            error!("Broker closed the event stream");
                            break;
                        }
                    }
                }
            }
            debug!("Event subscriber pump stopped");
        });

        let subscriber = Arc::clone(self);
        let cancel = self.cancel.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(subscriber.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => subscriber.sweep(),
                }
            }
        });

        Ok(vec![pump, sweeper])
    }

    /// Subscriptions held by a session.
    #[must_use]
    pub fn subscription_count(&self, session_id: &str) -> usize {
        self.subscriptions.get(session_id).map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn get_metrics(&self) -> SubscriberMetrics {
        SubscriberMetrics {
            sessions: self.subscriptions.len(),
            subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
            received: self.counters.received.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            replay_buffered: self.replay.len(),
            backlogged: self.backlogs.len(),
        }
    }
}

/// One bounded send to a session's outbound queue.
async fn send_event(
    counters: &Counters,
    delivery_timeout: Duration,
    session_id: &str,
    handle: &DeliveryHandle,
    event: &Event,
    replayed: bool,
) -> SendOutcome {
    let message = event.to_server_message(replayed);
    let outcome = tokio::select! {
        _ = handle.cancel.cancelled() => SendOutcome::Cancelled,
        sent = tokio::time::timeout(delivery_timeout, handle.sender.send(message)) => {
            match sent {
                Ok(Ok(())) => SendOutcome::Delivered,
                Ok(Err(_)) => SendOutcome::Failed,
                Err(_) => SendOutcome::TimedOut,
            }
        }
    };

    match outcome {
        SendOutcome::Delivered => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        SendOutcome::Failed => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(session = %session_id, event = %event.id, "Delivery failed: session closed");
        }
        SendOutcome::TimedOut => {
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(
                session = %session_id,
                event = %event.id,
                timeout_ms = delivery_timeout.as_millis() as u64,
                "Delivery timed out"
            );
        }
        SendOutcome::Queued | SendOutcome::Cancelled => {
            trace!(session = %session_id, event = %event.id, "Delivery cancelled");
        }
    }
    outcome
}

#[async_trait]
impl Component for EventSubscriber {
    fn name(&self) -> &'static str {
        "event_subscriber"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let sessions = self.subscriptions.len();
        self.subscriptions.clear();
        self.gates.clear();
        self.replayed_rooms.clear();
        self.backlogs.clear();
        self.replay.clear();
        info!(sessions, "Event subscriber shut down");
        Ok(())
    }
}
