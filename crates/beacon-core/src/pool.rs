//! Connection pool.
//!
//! The pool owns every live session. Admission checks the global,
//! per-organization and per-user caps and inserts the session in a single
//! critical section, so concurrent admissions can never overshoot a cap.

use async_trait::async_trait;
use beacon_protocol::ServerMessage;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::error::{CapacityLimit, EngineError};
use crate::health::ServiceHealth;
use crate::identity::Principal;
use crate::unix_millis;

/// A session identifier, assigned by the transport.
pub type SessionId = String;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live sessions in this process.
    pub max_connections: usize,
    /// Maximum live sessions per organization.
    pub max_connections_per_org: usize,
    /// Maximum live sessions per user.
    pub max_connections_per_user: usize,
    /// Sessions without activity for this long are considered stale.
    pub idle_timeout: Duration,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_org: 1_000,
            max_connections_per_user: 10,
            idle_timeout: Duration::from_secs(300),
            outbound_capacity: 256,
        }
    }
}

/// A live session.
#[derive(Debug)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Verified identity.
    pub principal: Principal,
    /// Outbound queue drained by the transport writer.
    pub sender: mpsc::Sender<ServerMessage>,
    /// Cancelled when the session must close.
    pub cancel: CancellationToken,
    /// When the connection opened (wall clock, ms).
    pub connected_at: u64,
    /// Last inbound activity.
    pub last_activity: Instant,
}

impl Session {
    /// Create a session.
    #[must_use]
    pub fn new(
        id: impl Into<SessionId>,
        principal: Principal,
        sender: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            principal,
            sender,
            cancel,
            connected_at: unix_millis(),
            last_activity: Instant::now(),
        }
    }
}

/// What the subscriber needs to push to a session.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    /// The session's bounded outbound queue.
    pub sender: mpsc::Sender<ServerMessage>,
    /// Cancelled when the session closes; pending sends give up.
    pub cancel: CancellationToken,
    /// Tenant of the session, checked against every event.
    pub organization_id: String,
}

/// Pool metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total: u64,
    pub active: usize,
    pub rejected: u64,
    pub per_organization: HashMap<String, usize>,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub memory_usage: usize,
}

#[derive(Debug, Default)]
struct Counters {
    per_org: HashMap<String, usize>,
    per_user: HashMap<String, usize>,
}

impl Counters {
    fn release(&mut self, principal: &Principal) {
        decrement(&mut self.per_org, &principal.organization_id);
        decrement(&mut self.per_user, &principal.user_key());
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// The connection pool.
pub struct ConnectionPool {
    sessions: DashMap<SessionId, Session>,
    /// Guards admission and removal; counters only change while held.
    counters: Mutex<Counters>,
    config: PoolConfig,
    total_admitted: AtomicU64,
    rejected: AtomicU64,
    handled: AtomicU64,
    errors: AtomicU64,
    response_micros: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        info!(
            max = config.max_connections,
            per_org = config.max_connections_per_org,
            per_user = config.max_connections_per_user,
            "Creating connection pool"
        );
        Self {
            sessions: DashMap::new(),
            counters: Mutex::new(Counters::default()),
            config,
            total_admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            response_micros: AtomicU64::new(0),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admit a session.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSession` if the id is already tracked, or
    /// `CapacityExceeded` when a cap is reached.
    pub fn add_connection(&self, session: Session) -> Result<(), EngineError> {
        let mut counters = self.counters.lock();

        if self.sessions.contains_key(&session.id) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::DuplicateSession(session.id));
        }

        let org = session.principal.organization_id.clone();
        let user = session.principal.user_key();

        let limit = if self.sessions.len() >= self.config.max_connections {
            Some(CapacityLimit::Global)
        } else if counters.per_org.get(&org).copied().unwrap_or(0)
            >= self.config.max_connections_per_org
        {
            Some(CapacityLimit::Organization(org.clone()))
        } else if counters.per_user.get(&user).copied().unwrap_or(0)
            >= self.config.max_connections_per_user
        {
            Some(CapacityLimit::User(session.principal.user_id.clone()))
        } else {
            None
        };

        if let Some(limit) = limit {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(session = %session.id, %limit, "Admission rejected");
            return Err(EngineError::CapacityExceeded(limit));
        }

        *counters.per_org.entry(org.clone()).or_insert(0) += 1;
        *counters.per_user.entry(user).or_insert(0) += 1;

        debug!(session = %session.id, org = %org, "Session admitted");
        self.sessions.insert(session.id.clone(), session);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Remove a session. Unknown ids are a no-op.
    pub fn remove_connection(&self, session_id: &str) -> Option<Session> {
        let mut counters = self.counters.lock();
        let (_, session) = self.sessions.remove(session_id)?;
        counters.release(&session.principal);
        debug!(session = %session_id, "Session removed");
        Some(session)
    }

    /// Record inbound activity for a session.
    ///
    /// Returns `false` if the session is unknown.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Whether a session is live.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Principal of a live session.
    #[must_use]
    pub fn principal(&self, session_id: &str) -> Option<Principal> {
        self.sessions.get(session_id).map(|s| s.principal.clone())
    }

    /// Delivery handle for a live session.
    #[must_use]
    pub fn delivery_handle(&self, session_id: &str) -> Option<DeliveryHandle> {
        self.sessions.get(session_id).map(|s| DeliveryHandle {
            sender: s.sender.clone(),
            cancel: s.cancel.clone(),
            organization_id: s.principal.organization_id.clone(),
        })
    }

    /// Outbound queues of every live session.
    #[must_use]
    pub fn senders(&self) -> Vec<(SessionId, mpsc::Sender<ServerMessage>)> {
        self.sessions
            .iter()
            .map(|s| (s.id.clone(), s.sender.clone()))
            .collect()
    }

    /// Ids of sessions idle for longer than the configured timeout.
    #[must_use]
    pub fn idle_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|s| now.duration_since(s.last_activity) > self.config.idle_timeout)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Signal a session to close. Returns `false` if the session is unknown.
    pub fn close(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Record the outcome of handling one inbound message.
    pub fn record_response(&self, elapsed: Duration, ok: bool) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.response_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the pool holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live sessions for an organization.
    #[must_use]
    pub fn organization_count(&self, organization_id: &str) -> usize {
        self.counters
            .lock()
            .per_org
            .get(organization_id)
            .copied()
            .unwrap_or(0)
    }

    /// Pool metrics.
    #[must_use]
    pub fn get_metrics(&self) -> PoolMetrics {
        let handled = self.handled.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let micros = self.response_micros.load(Ordering::Relaxed);
        let active = self.sessions.len();

        let per_session = std::mem::size_of::<Session>()
            + self.config.outbound_capacity * std::mem::size_of::<ServerMessage>();

        PoolMetrics {
            total: self.total_admitted.load(Ordering::Relaxed),
            active,
            rejected: self.rejected.load(Ordering::Relaxed),
            per_organization: self.counters.lock().per_org.clone(),
            avg_response_time_ms: if handled == 0 {
                0.0
            } else {
                micros as f64 / handled as f64 / 1000.0
            },
            error_rate: if handled == 0 {
                0.0
            } else {
                errors as f64 / handled as f64
            },
            memory_usage: active * per_session,
        }
    }
}

#[async_trait]
impl Component for ConnectionPool {
    fn name(&self) -> &'static str {
        "connection_pool"
    }

    fn metrics(&self) -> serde_json::Value {
        serde_json::to_value(self.get_metrics()).unwrap_or_default()
    }

    fn health(&self) -> ServiceHealth {
        let active = self.len();
        if active >= self.config.max_connections {
            ServiceHealth::degraded(
                self.name(),
                vec![format!("at capacity: {active} sessions")],
            )
        } else {
            ServiceHealth::healthy(self.name())
        }
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let mut counters = self.counters.lock();
        for session in self.sessions.iter() {
            session.cancel.cancel();
        }
        let evicted = self.sessions.len();
        self.sessions.clear();
        *counters = Counters::default();
        info!(evicted, "Connection pool shut down");
        Ok(())
    }
}
