//! Presence tracking.
//!
//! Each user walks the ladder `online -> idle -> away -> offline` as time
//! passes without a heartbeat. Any heartbeat or activity returns the user to
//! `online`. An explicit status (for example "busy") overrides the ladder
//! until the next ladder transition or until it is cleared.
//!
//! Every change of the visible status is published as a `presence.changed`
//! event to the organization room.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::error::EngineError;
use crate::event::{event_types, Event};
use crate::identity::{user_key, Principal};
use crate::pool::SessionId;
use crate::publisher::EventPublisher;
use crate::unix_millis;

/// Visible presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status request from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequest {
    Override(PresenceStatus),
    Clear,
}

impl FromStr for StatusRequest {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(StatusRequest::Override(PresenceStatus::Online)),
            "idle" => Ok(StatusRequest::Override(PresenceStatus::Idle)),
            "away" => Ok(StatusRequest::Override(PresenceStatus::Away)),
            "busy" | "dnd" | "do_not_disturb" => Ok(StatusRequest::Override(PresenceStatus::Busy)),
            "offline" | "invisible" => Ok(StatusRequest::Override(PresenceStatus::Offline)),
            "clear" | "auto" => Ok(StatusRequest::Clear),
            other => Err(EngineError::InvalidMessage(format!(
                "unknown presence status: {other}"
            ))),
        }
    }
}

/// Presence configuration.
///
/// Timeouts are measured from the last heartbeat and must be increasing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub idle_timeout: Duration,
    pub away_timeout: Duration,
    pub offline_timeout: Duration,
    /// Expected client heartbeat period; also the evaluation tick.
    pub heartbeat_interval: Duration,
    /// Status changes kept per user.
    pub history_size: usize,
    /// How long a user with no sessions stays tracked after going offline.
    pub offline_retention: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            away_timeout: Duration::from_secs(15 * 60),
            offline_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            history_size: 50,
            offline_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PresenceConfig {
    /// Check the timeout ladder.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` if the timeouts are not strictly increasing.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.idle_timeout < self.away_timeout && self.away_timeout < self.offline_timeout {
            Ok(())
        } else {
            Err(EngineError::InvalidMessage(
                "presence timeouts must satisfy idle < away < offline".to_string(),
            ))
        }
    }

    fn ladder(&self, since_heartbeat: Duration) -> PresenceStatus {
        if since_heartbeat >= self.offline_timeout {
            PresenceStatus::Offline
        } else if since_heartbeat >= self.away_timeout {
            PresenceStatus::Away
        } else if since_heartbeat >= self.idle_timeout {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Online
        }
    }
}

/// One recorded status change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub from: PresenceStatus,
    pub to: PresenceStatus,
    pub at: u64,
}

#[derive(Debug)]
struct PresenceRecord {
    user_id: String,
    organization_id: String,
    display_name: String,
    /// Ladder position.
    ladder: PresenceStatus,
    override_status: Option<PresenceStatus>,
    custom_message: Option<String>,
    last_heartbeat: Instant,
    last_seen: u64,
    offline_since: Option<Instant>,
    sessions: HashSet<SessionId>,
    history: VecDeque<StatusChange>,
}

impl PresenceRecord {
    fn new(principal: &Principal) -> Self {
        Self {
            user_id: principal.user_id.clone(),
            organization_id: principal.organization_id.clone(),
            display_name: principal.display_name.clone(),
            ladder: PresenceStatus::Offline,
            override_status: None,
            custom_message: None,
            last_heartbeat: Instant::now(),
            last_seen: unix_millis(),
            offline_since: None,
            sessions: HashSet::new(),
            history: VecDeque::new(),
        }
    }

    fn visible(&self) -> PresenceStatus {
        if self.ladder == PresenceStatus::Offline {
            return PresenceStatus::Offline;
        }
        self.override_status.unwrap_or(self.ladder)
    }

    /// Move along the ladder; any ladder transition drops the override.
    fn set_ladder(&mut self, status: PresenceStatus) {
        if self.ladder != status {
            self.ladder = status;
            self.override_status = None;
            self.custom_message = None;
            self.offline_since = (status == PresenceStatus::Offline).then(Instant::now);
        }
    }

    fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_seen = unix_millis();
        self.set_ladder(PresenceStatus::Online);
    }

    fn view(&self) -> PresenceView {
        PresenceView {
            user_id: self.user_id.clone(),
            organization_id: self.organization_id.clone(),
            display_name: self.display_name.clone(),
            status: self.visible(),
            custom_message: self.custom_message.clone(),
            last_seen: self.last_seen,
            sessions: self.sessions.len(),
        }
    }
}

/// Snapshot of one user's presence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub user_id: String,
    pub organization_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    pub last_seen: u64,
    pub sessions: usize,
}

/// Presence counts.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMetrics {
    pub users: usize,
    pub online: usize,
    pub idle: usize,
    pub away: usize,
    pub busy: usize,
    pub offline: usize,
    pub transitions: u64,
}

struct Transition {
    view: PresenceView,
    previous: PresenceStatus,
}

/// The presence manager.
pub struct PresenceManager {
    publisher: Arc<EventPublisher>,
    config: PresenceConfig,
    records: DashMap<String, PresenceRecord>,
    seq: AtomicU64,
    transitions: AtomicU64,
    cancel: CancellationToken,
}

impl PresenceManager {
    /// Create a presence manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout ladder is invalid.
    pub fn new(publisher: Arc<EventPublisher>, config: PresenceConfig) -> Result<Self, EngineError> {
        config.validate()?;
        info!("Creating presence manager with config: {:?}", config);
        Ok(Self {
            publisher,
            config,
            records: DashMap::new(),
            seq: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Apply `mutate` to a user's record and publish a change of visible
    /// status, if any.
    fn update<F>(&self, key: &str, mutate: F) -> Option<PresenceView>
    where
        F: FnOnce(&mut PresenceRecord),
    {
        let transition = {
            let mut record = self.records.get_mut(key)?;
            let previous = record.visible();
            mutate(&mut *record);
            let view = record.view();
            if view.status == previous {
                return None;
            }
            if record.history.len() >= self.config.history_size.max(1) {
                record.history.pop_front();
            }
            record.history.push_back(StatusChange {
                from: previous,
                to: view.status,
                at: unix_millis(),
            });
            Transition { view, previous }
        };
        self.announce(&transition);
        Some(transition.view)
    }

    fn announce(&self, transition: &Transition) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        let view = &transition.view;
        debug!(
            user = %view.user_id,
            org = %view.organization_id,
            from = %transition.previous,
            to = %view.status,
            "Presence changed"
        );

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(
            event_types::PRESENCE_CHANGED,
            view.organization_id.clone(),
            json!({
                "userId": view.user_id,
                "displayName": view.display_name,
                "status": view.status,
                "previous": transition.previous,
                "customMessage": view.custom_message,
                "lastSeen": view.last_seen,
            }),
        )
        .with_user(view.user_id.clone())
        .with_dedup_key(format!(
            "presence:{}:{}:{seq}",
            view.organization_id, view.user_id
        ));

        if let Err(err) = self.publisher.publish(event) {
            warn!(user = %view.user_id, error = %err, "Failed to publish presence change");
        }
    }

    /// Register a session for a user and mark the user online.
    pub fn set_user_online(&self, principal: &Principal, session_id: &str) -> PresenceView {
        let key = principal.user_key();
        self.records
            .entry(key.clone())
            .or_insert_with(|| PresenceRecord::new(principal));

        let session = session_id.to_string();
        self.update(&key, |record| {
            record.sessions.insert(session);
            record.heartbeat();
        })
        .or_else(|| self.records.get(&key).map(|r| r.view()))
        .unwrap_or_else(|| PresenceRecord::new(principal).view())
    }

    /// Drop a session. The user goes offline when their last session leaves.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the user is not tracked.
    pub fn set_user_offline(
        &self,
        organization_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<PresenceStatus, EngineError> {
        let key = user_key(organization_id, user_id);
        if !self.records.contains_key(&key) {
            return Err(EngineError::SessionNotFound(key));
        }

        self.update(&key, |record| {
            record.sessions.remove(session_id);
            record.last_seen = unix_millis();
            if record.sessions.is_empty() {
                record.set_ladder(PresenceStatus::Offline);
            }
        });
        self.current_status(&key)
    }

    /// Record a heartbeat or other activity.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the user is not tracked.
    pub fn update_user_activity(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<PresenceStatus, EngineError> {
        let key = user_key(organization_id, user_id);
        if !self.records.contains_key(&key) {
            return Err(EngineError::SessionNotFound(key));
        }
        self.update(&key, PresenceRecord::heartbeat);
        self.current_status(&key)
    }

    /// Set or clear an explicit status.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` for an unknown status and `SessionNotFound`
    /// if the user is not tracked.
    pub fn set_user_status(
        &self,
        organization_id: &str,
        user_id: &str,
        status: &str,
        custom_message: Option<String>,
    ) -> Result<PresenceStatus, EngineError> {
        let request: StatusRequest = status.parse()?;
        let key = user_key(organization_id, user_id);
        if !self.records.contains_key(&key) {
            return Err(EngineError::SessionNotFound(key));
        }

        self.update(&key, |record| match request {
            StatusRequest::Override(status) => {
                record.override_status = Some(status);
                record.custom_message = custom_message;
            }
            StatusRequest::Clear => {
                record.override_status = None;
                record.custom_message = None;
            }
        });
        self.current_status(&key)
    }

    fn current_status(&self, key: &str) -> Result<PresenceStatus, EngineError> {
        self.records
            .get(key)
            .map(|r| r.visible())
            .ok_or_else(|| EngineError::SessionNotFound(key.to_string()))
    }

    /// Advance every user along the timeout ladder, then forget users that
    /// have been offline with no session for `offline_retention`.
    ///
    /// Returns the number of visible status changes.
    pub fn evaluate(&self) -> usize {
        let now = Instant::now();
        let keys: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.ladder != PresenceStatus::Offline)
            .map(|r| r.key().clone())
            .collect();

        let mut changed = 0;
        for key in keys {
            let view = self.update(&key, |record| {
                let next = self
                    .config
                    .ladder(now.saturating_duration_since(record.last_heartbeat));
                // The ladder only moves forward between heartbeats.
                if rank(next) > rank(record.ladder) {
                    record.set_ladder(next);
                }
            });
            if view.is_some() {
                changed += 1;
            }
        }

        let retention = self.config.offline_retention;
        let mut pruned = 0;
        self.records.retain(|_, record| {
            let expired = record.sessions.is_empty()
                && record
                    .offline_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= retention);
            if expired {
                pruned += 1;
            }
            !expired
        });
        if pruned > 0 {
            debug!(pruned, "Forgot offline users");
        }
        changed
    }

    /// Presence of every known user in an organization.
    #[must_use]
    pub fn get_team_presence(&self, organization_id: &str) -> Vec<PresenceView> {
        let mut team: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.view())
            .collect();
        team.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        team
    }

    #[must_use]
    pub fn get_user_presence(&self, organization_id: &str, user_id: &str) -> Option<PresenceView> {
        self.records
            .get(&user_key(organization_id, user_id))
            .map(|r| r.view())
    }

    /// Recorded status changes of a user, oldest first.
    #[must_use]
    pub fn history(&self, organization_id: &str, user_id: &str) -> Vec<StatusChange> {
        self.records
            .get(&user_key(organization_id, user_id))
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn the ladder evaluation ticker.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let presence = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(presence.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        presence.evaluate();
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn get_metrics(&self) -> PresenceMetrics {
        let mut metrics = PresenceMetrics {
            transitions: self.transitions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for record in self.records.iter() {
            metrics.users += 1;
            match record.visible() {
                PresenceStatus::Online => metrics.online += 1,
                PresenceStatus::Idle => metrics.idle += 1,
                PresenceStatus::Away => metrics.away += 1,
                PresenceStatus::Busy => metrics.busy += 1,
                PresenceStatus::Offline => metrics.offline += 1,
            }
        }
        metrics
    }
}

fn rank(status: PresenceStatus) -> u8 {
    match status {
        PresenceStatus::Online | PresenceStatus::Busy => 0,
        PresenceStatus::Idle => 1,
        PresenceStatus::Away => 2,
        PresenceStatus::Offline => 3,
    }
}

#[async_trait]
impl Component for PresenceManager {
    fn name(&self) -> &'static str {
        "presence_manager"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        let keys: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            self.update(&key, |record| {
                record.sessions.clear();
                record.set_ladder(PresenceStatus::Offline);
            });
        }
        self.records.clear();
        info!("Presence manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LocalBroker, EVENTS_TOPIC};
    use crate::identity::Role;
    use crate::publisher::PublisherConfig;
    use tokio::sync::broadcast;

    const MIN: Duration = Duration::from_secs(60);

    async fn setup() -> (PresenceManager, Arc<EventPublisher>, broadcast::Receiver<Arc<Event>>) {
        let broker = Arc::new(LocalBroker::default());
        let rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();
        let publisher = Arc::new(EventPublisher::new(broker, PublisherConfig::default()));
        let presence =
            PresenceManager::new(Arc::clone(&publisher), PresenceConfig::default()).unwrap();
        (presence, publisher, rx)
    }

    fn alice() -> Principal {
        Principal::new("alice", "acme", Role::Member, "Alice")
    }

    fn status(presence: &PresenceManager) -> PresenceStatus {
        presence.get_user_presence("acme", "alice").unwrap().status
    }

    #[test]
    fn test_invalid_ladder_rejected() {
        let config = PresenceConfig {
            away_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_status_request_parsing() {
        assert_eq!(
            "DND".parse::<StatusRequest>().unwrap(),
            StatusRequest::Override(PresenceStatus::Busy)
        );
        assert_eq!("clear".parse::<StatusRequest>().unwrap(), StatusRequest::Clear);
        assert!("sleeping".parse::<StatusRequest>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        assert_eq!(status(&presence), PresenceStatus::Online);

        tokio::time::advance(6 * MIN).await;
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Idle);

        tokio::time::advance(10 * MIN).await;
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Away);

        tokio::time::advance(15 * MIN).await;
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_returns_to_online() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");

        tokio::time::advance(20 * MIN).await;
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Away);

        assert_eq!(
            presence.update_user_activity("acme", "alice").unwrap(),
            PresenceStatus::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_is_sticky_until_ladder_moves() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");

        presence
            .set_user_status("acme", "alice", "dnd", Some("focus time".into()))
            .unwrap();
        assert_eq!(status(&presence), PresenceStatus::Busy);

        // A heartbeat while already online keeps the override
        presence.update_user_activity("acme", "alice").unwrap();
        assert_eq!(status(&presence), PresenceStatus::Busy);

        tokio::time::advance(6 * MIN).await;
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Idle);
        assert!(presence
            .get_user_presence("acme", "alice")
            .unwrap()
            .custom_message
            .is_none());
    }

    #[tokio::test]
    async fn test_explicit_clear() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        presence
            .set_user_status("acme", "alice", "away", None)
            .unwrap();

        assert_eq!(
            presence
                .set_user_status("acme", "alice", "clear", None)
                .unwrap(),
            PresenceStatus::Online
        );
    }

    #[tokio::test]
    async fn test_offline_only_after_last_session() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        presence.set_user_online(&alice(), "s-2");

        assert_eq!(
            presence.set_user_offline("acme", "alice", "s-1").unwrap(),
            PresenceStatus::Online
        );
        assert_eq!(
            presence.set_user_offline("acme", "alice", "s-2").unwrap(),
            PresenceStatus::Offline
        );
        assert!(presence
            .set_user_offline("acme", "nobody", "s-3")
            .unwrap_err()
            .is_benign());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_transition_is_published() {
        let (presence, publisher, mut rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        tokio::time::advance(6 * MIN).await;
        presence.evaluate();
        presence.set_user_offline("acme", "alice", "s-1").unwrap();
        publisher.flush().await;

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.event_type, "presence.changed");
            assert_eq!(event.room, "org:acme");
            statuses.push(event.payload["status"].as_str().unwrap().to_string());
        }
        assert_eq!(statuses, vec!["online", "idle", "offline"]);
        assert_eq!(presence.history("acme", "alice").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_users_are_forgotten_after_retention() {
        let broker = Arc::new(LocalBroker::default());
        let publisher = Arc::new(EventPublisher::new(broker, PublisherConfig::default()));
        let presence = PresenceManager::new(
            publisher,
            PresenceConfig {
                offline_retention: 60 * MIN,
                ..Default::default()
            },
        )
        .unwrap();
        let bob = Principal::new("bob", "acme", Role::Member, "Bob");
        presence.set_user_online(&alice(), "s-1");
        presence.set_user_online(&bob, "s-2");
        presence.set_user_offline("acme", "alice", "s-1").unwrap();

        tokio::time::advance(59 * MIN).await;
        presence.update_user_activity("acme", "bob").unwrap();
        presence.evaluate();
        assert_eq!(status(&presence), PresenceStatus::Offline);
        assert_eq!(presence.history("acme", "alice").len(), 2);

        tokio::time::advance(MIN).await;
        presence.evaluate();
        assert!(presence.get_user_presence("acme", "alice").is_none());
        assert!(presence.history("acme", "alice").is_empty());
        assert_eq!(
            presence.get_user_presence("acme", "bob").unwrap().status,
            PresenceStatus::Online
        );

        // A returning user starts a fresh record
        presence.set_user_online(&alice(), "s-3");
        assert_eq!(status(&presence), PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_team_presence_is_scoped() {
        let (presence, _publisher, _rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        presence.set_user_online(&Principal::new("bob", "acme", Role::Viewer, "Bob"), "s-2");
        presence.set_user_online(&Principal::new("eve", "globex", Role::Viewer, "Eve"), "s-3");

        let team = presence.get_team_presence("acme");
        let users: Vec<_> = team.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
        assert_eq!(presence.get_metrics().online, 3);
    }

    #[tokio::test]
    async fn test_shutdown_marks_everyone_offline() {
        let (presence, publisher, mut rx) = setup().await;
        presence.set_user_online(&alice(), "s-1");
        presence.shutdown().await.unwrap();
        publisher.flush().await;

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event.payload["status"].clone());
        }
        assert_eq!(last, Some(json!("offline")));
        assert_eq!(presence.get_metrics().users, 0);
    }
}
