//! Organization activity feed.
//!
//! Actions are recorded locally and published as `activity.recorded` events;
//! the broker consumer ingests the same events from other processes, skipping
//! records already held. Feeds are ranked by a relevance score that decays
//! with age.

use async_trait::async_trait;
use beacon_protocol::ActivityFilters;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::Broker;
use crate::component::Component;
use crate::error::EngineError;
use crate::event::{event_types, Event};
use crate::publisher::EventPublisher;
use crate::unix_millis;

/// Default page size of `get_feed`.
pub const DEFAULT_FEED_LIMIT: usize = 20;
/// Largest page `get_feed` returns.
pub const MAX_FEED_LIMIT: usize = 100;

/// Activity feed configuration.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Records kept per organization.
    pub max_feed_size: usize,
    /// Records scoring below this are left out of feeds.
    pub relevance_threshold: f64,
    /// Look-back window of `insights`.
    pub insights_period: Duration,
    /// Age at which a record's score halves.
    pub recency_half_life: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            max_feed_size: 500,
            relevance_threshold: 0.1,
            insights_period: Duration::from_secs(24 * 60 * 60),
            recency_half_life: Duration::from_secs(60 * 60),
        }
    }
}

/// Base relevance of an action.
#[must_use]
pub fn action_weight(action: &str) -> f64 {
    match action {
        "dashboard.created" | "dashboard.shared" => 1.0,
        "dashboard.updated" | "alert.triggered" => 0.8,
        "dashboard.collaboration" => 0.6,
        "room.joined" | "session.connected" => 0.3,
        "session.disconnected" => 0.2,
        _ => 0.5,
    }
}

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: u64,
}

impl ActivityRecord {
    /// A record stamped now.
    #[must_use]
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            action: action.into(),
            target: None,
            metadata: serde_json::Value::Null,
            timestamp: unix_millis(),
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn relevance(&self, now: u64, half_life: Duration) -> f64 {
        let age_ms = now.saturating_sub(self.timestamp) as f64;
        let half_life_ms = half_life.as_millis().max(1) as f64;
        action_weight(&self.action) * 0.5_f64.powf(age_ms / half_life_ms)
    }

    fn matches(&self, filters: &ActivityFilters) -> bool {
        filters
            .user_id
            .as_deref()
            .map_or(true, |user| user == self.user_id)
            && filters
                .action
                .as_deref()
                .map_or(true, |action| action == self.action)
    }
}

/// A page of the feed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<ActivityRecord>,
    pub total: usize,
    pub has_more: bool,
}

/// Per-user activity count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub user_id: String,
    pub count: usize,
}

/// Activity summary over the insights period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInsights {
    pub period_ms: u64,
    pub total: usize,
    pub action_counts: BTreeMap<String, usize>,
    pub most_active_users: Vec<UserActivity>,
}

/// Feed metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    pub organizations: usize,
    pub records: usize,
}

#[derive(Debug, Default)]
struct OrgFeed {
    records: VecDeque<ActivityRecord>,
    ids: HashSet<String>,
}

/// The activity feed.
pub struct ActivityFeed {
    publisher: Arc<EventPublisher>,
    config: ActivityConfig,
    feeds: DashMap<String, OrgFeed>,
    cancel: CancellationToken,
}

impl ActivityFeed {
    /// Create an activity feed.
    #[must_use]
    pub fn new(publisher: Arc<EventPublisher>, config: ActivityConfig) -> Self {
        info!("Creating activity feed with config: {:?}", config);
        Self {
            publisher,
            config,
            feeds: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Record an action and publish it to the organization.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once the publisher is closed. The record is
    /// still kept locally.
    pub fn record_activity(&self, record: ActivityRecord) -> Result<(), EngineError> {
        self.ingest(record.clone());

        let payload = serde_json::to_value(&record)
            .map_err(|err| EngineError::InvalidMessage(err.to_string()))?;
        let event = Event::new(
            event_types::ACTIVITY_RECORDED,
            record.organization_id.clone(),
            payload,
        )
        .with_user(record.user_id.clone())
        .with_dedup_key(format!("activity:{}", record.id));

        self.publisher.publish(event).map(|_| ())
    }

    /// Add a record unless it is already held. Returns whether it was added.
    pub fn ingest(&self, record: ActivityRecord) -> bool {
        let mut feed = self.feeds.entry(record.organization_id.clone()).or_default();
        if !feed.ids.insert(record.id.clone()) {
            return false;
        }
        trace!(org = %record.organization_id, action = %record.action, "Recorded activity");
        feed.records.push_back(record);
        while feed.records.len() > self.config.max_feed_size {
            if let Some(evicted) = feed.records.pop_front() {
                feed.ids.remove(&evicted.id);
            }
        }
        true
    }

    /// Ranked feed page for an organization.
    #[must_use]
    pub fn get_feed(
        &self,
        organization_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
        filters: Option<&ActivityFilters>,
    ) -> FeedPage {
        self.feed_at(organization_id, limit, offset, filters, unix_millis())
    }

    fn feed_at(
        &self,
        organization_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
        filters: Option<&ActivityFilters>,
        now: u64,
    ) -> FeedPage {
        let limit = limit.unwrap_or(DEFAULT_FEED_LIMIT).clamp(1, MAX_FEED_LIMIT);
        let offset = offset.unwrap_or(0);

        let mut ranked: Vec<(f64, ActivityRecord)> = self
            .feeds
            .get(organization_id)
            .map(|feed| {
                feed.records
                    .iter()
                    .filter(|r| filters.map_or(true, |f| r.matches(f)))
                    .map(|r| (r.relevance(now, self.config.recency_half_life), r.clone()))
                    .filter(|(score, _)| *score >= self.config.relevance_threshold)
                    .collect()
            })
            .unwrap_or_default();

        ranked.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .total_cmp(a_score)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });

        let total = ranked.len();
        let items: Vec<ActivityRecord> = ranked
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, record)| record)
            .collect();
        FeedPage {
            has_more: offset + items.len() < total,
            items,
            total,
        }
    }

    /// Action counts and most active users over the insights period.
    #[must_use]
    pub fn insights(&self, organization_id: &str) -> ActivityInsights {
        self.insights_at(organization_id, unix_millis())
    }

    fn insights_at(&self, organization_id: &str, now: u64) -> ActivityInsights {
        let period_ms = self.config.insights_period.as_millis() as u64;
        let since = now.saturating_sub(period_ms);

        let mut action_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut per_user: HashMap<String, usize> = HashMap::new();
        let mut total = 0;

        if let Some(feed) = self.feeds.get(organization_id) {
            for record in feed.records.iter().filter(|r| r.timestamp >= since) {
                total += 1;
                *action_counts.entry(record.action.clone()).or_default() += 1;
                *per_user.entry(record.user_id.clone()).or_default() += 1;
            }
        }

        let mut most_active_users: Vec<UserActivity> = per_user
            .into_iter()
            .map(|(user_id, count)| UserActivity { user_id, count })
            .collect();
        most_active_users.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.user_id.cmp(&b.user_id)));
        most_active_users.truncate(5);

        ActivityInsights {
            period_ms,
            total,
            action_counts,
            most_active_users,
        }
    }

    /// Consume `activity.recorded` events from the broker.
    ///
    /// # Errors
    ///
    /// Returns `BrokerUnavailable` if the broker subscription fails.
    pub async fn attach(
        self: &Arc<Self>,
        broker: Arc<dyn Broker>,
        topic: &str,
    ) -> Result<JoinHandle<()>, EngineError> {
        let mut receiver = broker.subscribe(topic).await?;
        let feed = Arc::clone(self);
        let cancel = self.cancel.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) if event.event_type == event_types::ACTIVITY_RECORDED => {
                            match serde_json::from_value::<ActivityRecord>(event.payload.clone()) {
                                Ok(record) => {
                                    feed.ingest(record);
                                }
                                Err(err) => warn!(event = %event.id, error = %err, "Malformed activity event"),
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Activity consumer lagged behind broker");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Activity consumer stopped");
        }))
    }

    #[must_use]
    pub fn get_metrics(&self) -> ActivityMetrics {
        ActivityMetrics {
            organizations: self.feeds.len(),
            records: self.feeds.iter().map(|f| f.records.len()).sum(),
        }
    }
}

#[async_trait]
impl Component for ActivityFeed {
    fn name(&self) -> &'static str {
        "activity_feed"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.feeds.clear();
        info!("Activity feed shut down");
        Ok(())
    }
}
