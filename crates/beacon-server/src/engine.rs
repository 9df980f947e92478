//! Engine wiring and lifecycle.
//!
//! The [`Engine`] owns one instance of every component, attaches them to the
//! broker, runs the health and metrics ticks and drives ordered shutdown.
//! Sessions are spawned on a [`TaskTracker`] so shutdown can wait for every
//! teardown to finish before components go away.

use beacon_core::{
    unix_millis, ActivityConfig, ActivityFeed, Authenticator, Broker, Component, ConnectionPool,
    EngineError, EventPublisher, EventSubscriber, HealthRegistry, HealthStatus, MetricsStream,
    OrganizationPolicy, PoolConfig, PresenceConfig, PresenceManager, PublisherConfig, RoomConfig,
    RoomManager, ServiceHealth, StreamConfig, SubscriberConfig,
};
use beacon_protocol::ServerMessage;
use beacon_transport::{Connection, Transport, TransportError};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::session;

/// Orchestrator timing.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
    /// Time between the shutdown notice and closing sessions.
    pub shutdown_grace: Duration,
    /// Upper bound on each shutdown wait (session teardown, each component).
    pub shutdown_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration of every component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub rooms: RoomConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub stream: StreamConfig,
    pub presence: PresenceConfig,
    pub activity: ActivityConfig,
    pub settings: EngineSettings,
}

/// A component that failed to shut down cleanly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownFailure {
    pub component: String,
    pub error: String,
}

/// Outcome of [`Engine::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Sessions that were handed the shutdown notice.
    pub notified: usize,
    /// Components whose shutdown was attempted, in order.
    pub attempted: Vec<String>,
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    /// Whether every step completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, component: &str, error: impl Into<String>) {
        self.failures.push(ShutdownFailure {
            component: component.to_string(),
            error: error.into(),
        });
    }
}

/// The running engine.
pub struct Engine {
    pub pool: Arc<ConnectionPool>,
    pub rooms: Arc<RoomManager>,
    pub publisher: Arc<EventPublisher>,
    pub subscriber: Arc<EventSubscriber>,
    pub stream: Arc<MetricsStream>,
    pub presence: Arc<PresenceManager>,
    pub activity: Arc<ActivityFeed>,
    pub authenticator: Arc<dyn Authenticator>,
    broker: Arc<dyn Broker>,
    health: HealthRegistry,
    settings: EngineSettings,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build every component and attach the engine to the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence ladder is invalid or the broker
    /// cannot be attached. Both are fatal for startup.
    pub async fn start(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>, EngineError> {
        info!("Starting engine with settings: {:?}", config.settings);

        let topic = config.publisher.topic.clone();
        let pool = Arc::new(ConnectionPool::new(config.pool));
        let rooms = Arc::new(RoomManager::new(config.rooms, Arc::new(OrganizationPolicy)));
        let publisher = Arc::new(EventPublisher::new(Arc::clone(&broker), config.publisher));
        let subscriber = Arc::new(EventSubscriber::new(
            Arc::clone(&pool),
            Arc::clone(&rooms),
            config.subscriber,
        ));
        let stream = Arc::new(MetricsStream::new(Arc::clone(&publisher), config.stream));
        let presence = Arc::new(PresenceManager::new(
            Arc::clone(&publisher),
            config.presence,
        )?);
        let activity = Arc::new(ActivityFeed::new(Arc::clone(&publisher), config.activity));

        let mut background = subscriber
            .start(Arc::clone(&broker), &topic)
            .await
            .map_err(|err| {
                error!(broker = broker.name(), error = %err, "Event subscriber could not attach");
                err
            })?;

        match activity.attach(Arc::clone(&broker), &topic).await {
            Ok(handle) => background.push(handle),
            Err(err) => {
                error!(broker = broker.name(), error = %err, "Activity feed could not attach");
                if let Err(cleanup) = subscriber.shutdown().await {
                    warn!(error = %cleanup, "Event subscriber cleanup failed");
                }
                return Err(err);
            }
        }

        background.push(publisher.start());
        background.push(stream.start());
        background.push(presence.start());
        background.push(rooms.spawn_sweeper());

        let engine = Arc::new(Self {
            pool,
            rooms,
            publisher,
            subscriber,
            stream,
            presence,
            activity,
            authenticator,
            broker,
            health: HealthRegistry::new(),
            settings: config.settings,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            background: Mutex::new(background),
        });

        engine.check_health();
        let ticks = engine.spawn_ticks();
        engine.background.lock().push(ticks);

        info!(broker = engine.broker.name(), topic = %topic, "Engine started");
        Ok(engine)
    }

    /// Components in shutdown order.
    fn components(&self) -> Vec<Arc<dyn Component>> {
        vec![
            Arc::clone(&self.presence) as Arc<dyn Component>,
            Arc::clone(&self.activity) as Arc<dyn Component>,
            Arc::clone(&self.stream) as Arc<dyn Component>,
            Arc::clone(&self.subscriber) as Arc<dyn Component>,
            Arc::clone(&self.publisher) as Arc<dyn Component>,
            Arc::clone(&self.pool) as Arc<dyn Component>,
            Arc::clone(&self.rooms) as Arc<dyn Component>,
        ]
    }

    fn spawn_ticks(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut health = tokio::time::interval(engine.settings.health_check_interval);
            let mut metrics = tokio::time::interval(engine.settings.metrics_interval);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = health.tick() => {
                        engine.check_health();
                        engine.evict_idle();
                    }
                    _ = metrics.tick() => crate::metrics::record_engine(&engine),
                }
            }
            debug!("Engine ticks stopped");
        })
    }

    /// Recompute every health record.
    pub fn check_health(&self) {
        let mut records: Vec<ServiceHealth> =
            self.components().iter().map(|c| c.health()).collect();

        let broker = format!("broker:{}", self.broker.name());
        records.push(if self.broker.is_healthy() {
            ServiceHealth::healthy(broker)
        } else {
            ServiceHealth::unhealthy(broker, vec!["broker is not accepting events".to_string()])
        });

        for record in records {
            if record.status != HealthStatus::Healthy {
                warn!(
                    service = %record.service,
                    status = ?record.status,
                    errors = ?record.errors,
                    "Service is not healthy"
                );
            }
            self.health.replace(record);
        }
    }

    /// Close sessions idle past the pool timeout.
    pub fn evict_idle(&self) -> usize {
        let idle = self.pool.idle_sessions();
        for session in &idle {
            debug!(session = %session, "Closing idle session");
            self.pool.close(session);
        }
        idle.len()
    }

    /// Latest health records and overall status.
    #[must_use]
    pub fn health_report(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.health.overall(),
            "services": self.health.snapshot(),
            "connections": self.pool.len(),
            "timestamp": unix_millis(),
        })
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when shutdown begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run a connection to completion on the session tracker.
    pub async fn handle_connection(self: &Arc<Self>, connection: Box<dyn Connection>) {
        self.sessions
            .track_future(session::run(Arc::clone(self), connection))
            .await;
    }

    /// Spawn a connection on the session tracker.
    pub fn spawn_connection(self: &Arc<Self>, connection: Box<dyn Connection>) -> JoinHandle<()> {
        self.sessions
            .spawn(session::run(Arc::clone(self), connection))
    }

    /// Accept connections from a transport until shutdown.
    pub async fn serve(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        info!(transport = transport.name(), "Accepting connections");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = transport.accept() => match accepted {
                    Ok(connection) => {
                        self.spawn_connection(connection);
                    }
                    Err(TransportError::ConnectionClosed) => {
                        info!(transport = transport.name(), "Transport closed");
                        break;
                    }
                    Err(err) => warn!(error = %err, "Failed to accept connection"),
                }
            }
        }
    }

    /// Shut the engine down.
    ///
    /// Stops accepting connections, sends every session a `server_shutdown`
    /// notice, waits the grace period, closes the sessions and then shuts
    /// down each component in order. Every step runs even when an earlier
    /// one failed; failures are collected in the report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shutdown.is_cancelled() {
            warn!("Shutdown already in progress");
            return report;
        }

        info!(sessions = self.pool.len(), "Shutting down engine");
        self.shutdown.cancel();

        let grace = self.settings.shutdown_grace;
        let notice = ServerMessage::server_shutdown("Server is shutting down", unix_millis());
        let deliveries = self.pool.senders().into_iter().map(|(session, sender)| {
            let notice = notice.clone();
            async move {
                match timeout(grace, sender.send(notice)).await {
                    Ok(Ok(())) => true,
                    _ => {
                        debug!(session = %session, "Shutdown notice not delivered");
                        false
                    }
                }
            }
        });
        report.notified = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();

        tokio::time::sleep(grace).await;

        for (session, _) in self.pool.senders() {
            self.pool.close(&session);
        }
        self.sessions.close();
        if timeout(self.settings.shutdown_timeout, self.sessions.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.sessions.len(), "Session teardown timed out");
            report.fail(
                "sessions",
                format!("{} sessions still tearing down", self.sessions.len()),
            );
        }

        for component in self.components() {
            let name = component.name();
            report.attempted.push(name.to_string());
            match timeout(self.settings.shutdown_timeout, component.shutdown()).await {
                Ok(Ok(())) => debug!(component = name, "Component shut down"),
                Ok(Err(err)) => {
                    warn!(component = name, error = %err, "Component shutdown failed");
                    report.fail(name, err.to_string());
                }
                Err(_) => {
                    warn!(component = name, "Component shutdown timed out");
                    report.fail(name, "timed out");
                }
            }
        }

        let handles = std::mem::take(&mut *self.background.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if timeout(self.settings.shutdown_timeout, join_all(handles))
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time");
            for handle in aborts {
                handle.abort();
            }
        }

        info!(
            notified = report.notified,
            failures = report.failures.len(),
            "Engine shut down"
        );
        report
    }
}
