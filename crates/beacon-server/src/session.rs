//! Per-connection lifecycle.
//!
//! A session walks `connecting → authenticated → joined-default-room →
//! active → disconnecting → closed`. While active, inbound messages are
//! handled one at a time through the [`DispatchTable`]. Outbound traffic
//! (replies, fan-out and the shutdown notice) goes through one bounded
//! queue drained by a writer task, so replies and events keep their order.

use beacon_core::event::event_types;
use beacon_core::room::organization_room;
use beacon_core::{
    unix_millis, ActivityRecord, EngineError, Principal, Session, SessionId, SubscriptionRequest,
};
use beacon_protocol::{codes, ClientMessage, MessageType, ServerMessage};
use beacon_transport::{Connection, MessageSink, MessageStream};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchTable;
use crate::engine::Engine;
use crate::metrics::{self, ConnectionMetricsGuard};

/// Event types every session receives from the rooms it has joined.
const DEFAULT_EVENT_TYPES: [&str; 3] = [
    event_types::PRESENCE_CHANGED,
    event_types::DASHBOARD_COLLABORATION,
    event_types::SYSTEM_NOTICE,
];

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    JoinedDefaultRoom,
    Active,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether `next` may follow `self`.
    #[must_use]
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, JoinedDefaultRoom)
                | (JoinedDefaultRoom, Active)
                | (Connecting | Authenticated | JoinedDefaultRoom | Active, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::JoinedDefaultRoom => "joined-default-room",
            ConnectionState::Active => "active",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Validated state holder for one connection.
#[derive(Debug)]
pub struct StateMachine {
    session: SessionId,
    state: ConnectionState,
}

impl StateMachine {
    #[must_use]
    pub fn new(session: impl Into<SessionId>) -> Self {
        Self {
            session: session.into(),
            state: ConnectionState::Connecting,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` if the transition is not allowed; the state
    /// is left unchanged.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), EngineError> {
        if !self.state.can_transition(next) {
            return Err(EngineError::InvalidMessage(format!(
                "invalid connection state transition {} -> {next}",
                self.state
            )));
        }
        debug!(session = %self.session, from = %self.state, to = %next, "Connection state changed");
        self.state = next;
        Ok(())
    }

    fn step(&mut self, next: ConnectionState) {
        if let Err(err) = self.advance(next) {
            warn!(session = %self.session, error = %err, "Rejected state transition");
        }
    }
}

/// What a handler asks the session loop to do.
#[derive(Debug)]
pub enum Outcome {
    /// Send a reply.
    Reply(ServerMessage),
    /// Send a reply describing a refused request.
    Refused(ServerMessage, EngineError),
    /// Nothing to send.
    Silent,
    /// Close the session with a reason.
    Close(String),
}

/// Everything a handler needs about its session.
pub struct SessionContext {
    pub engine: Arc<Engine>,
    pub session_id: SessionId,
    pub principal: Principal,
    sender: mpsc::Sender<ServerMessage>,
}

impl SessionContext {
    pub(crate) fn new(
        engine: Arc<Engine>,
        session_id: SessionId,
        principal: Principal,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            engine,
            session_id,
            principal,
            sender,
        }
    }

    /// Queue a message for this session. Returns `false` once the writer is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).await.is_ok()
    }

    /// Queue an error message for this session.
    pub async fn send_error(&self, err: &EngineError) -> bool {
        metrics::record_error(err.code());
        self.send(ServerMessage::error(err.code(), err.to_string()))
            .await
    }

    /// Refresh liveness in the pool and presence.
    fn touch(&self) {
        self.engine.pool.touch(&self.session_id);
        if let Err(err) = self
            .engine
            .presence
            .update_user_activity(&self.principal.organization_id, &self.principal.user_id)
        {
            debug!(session = %self.session_id, error = %err, "Presence activity not recorded");
        }
    }

    /// Record an activity for this session's user.
    pub fn record_activity(&self, action: &str, target: Option<&str>, metadata: serde_json::Value) {
        let mut record = ActivityRecord::new(
            self.principal.organization_id.clone(),
            self.principal.user_id.clone(),
            action,
        )
        .with_metadata(metadata);
        if let Some(target) = target {
            record = record.with_target(target);
        }
        if let Err(err) = self.engine.activity.record_activity(record) {
            debug!(session = %self.session_id, action, error = %err, "Activity not published");
        }
    }

    /// Handle one inbound message. Returns a close reason when the session
    /// should end.
    async fn handle(&self, table: &DispatchTable, message: ClientMessage) -> Option<String> {
        let message_type = message.message_type();
        let started = Instant::now();
        self.touch();
        metrics::record_message(message_type.as_str());

        let result = table.dispatch(self, message).await;
        let ok = result.is_ok();
        let close = match result {
            Ok(Outcome::Reply(reply)) => {
                self.send(reply).await;
                None
            }
            Ok(Outcome::Refused(reply, err)) => {
                debug!(session = %self.session_id, message = %message_type, error = %err, "Request refused");
                metrics::record_error(err.code());
                self.send(reply).await;
                None
            }
            Ok(Outcome::Silent) => None,
            Ok(Outcome::Close(reason)) => Some(reason),
            Err(err) => {
                debug!(session = %self.session_id, message = %message_type, error = %err, "Request failed");
                self.send_error(&err).await;
                None
            }
        };

        let elapsed = started.elapsed();
        metrics::record_latency(message_type.as_str(), elapsed.as_secs_f64());
        self.engine.pool.record_response(elapsed, ok);
        close
    }
}

/// Capabilities advertised in `connected`.
fn capabilities() -> Vec<String> {
    MessageType::ALL
        .iter()
        .map(|t| t.as_str().to_string())
        .collect()
}

/// Send an error on a sink that never became a session, then close it.
async fn reject(session: &str, sink: &mut Box<dyn MessageSink>, err: &EngineError) {
    info!(session = %session, code = err.code(), error = %err, "Connection rejected");
    metrics::record_error(err.code());
    if let Err(send_err) = sink
        .send(ServerMessage::error(err.code(), err.to_string()))
        .await
    {
        debug!(session = %session, error = %send_err, "Rejection not delivered");
    }
    if let Err(close_err) = sink.close().await {
        debug!(session = %session, error = %close_err, "Close failed");
    }
}

/// Drain the outbound queue into the sink until cancelled.
fn spawn_writer(
    session: SessionId,
    mut sink: Box<dyn MessageSink>,
    mut receiver: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = receiver.recv() => match message {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            debug!(session = %session, error = %err, "Send failed, closing session");
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(message) = receiver.try_recv() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        if let Err(err) = sink.close().await {
            debug!(session = %session, error = %err, "Close failed");
        }
    })
}

/// Drive one connection from accept to close.
pub async fn run(engine: Arc<Engine>, connection: Box<dyn Connection>) {
    let _guard = ConnectionMetricsGuard::new();
    let session_id: SessionId = connection.id().to_string();
    let credential = connection.credential().map(str::to_string);
    let remote = connection.remote_addr();
    let (mut sink, mut stream) = connection.split();
    let mut state = StateMachine::new(session_id.clone());

    debug!(session = %session_id, remote = ?remote, "Connection opened");

    if engine.is_shutting_down() {
        reject(&session_id, &mut sink, &EngineError::ShuttingDown).await;
        return;
    }

    let authenticated = match credential {
        Some(token) => engine.authenticator.authenticate(&token).await,
        None => Err(EngineError::Unauthorized("missing credential".to_string())),
    };
    let principal = match authenticated {
        Ok(principal) => principal,
        Err(err) => {
            reject(&session_id, &mut sink, &err).await;
            return;
        }
    };
    state.step(ConnectionState::Authenticated);

    let (sender, receiver) = mpsc::channel(engine.pool.config().outbound_capacity.max(1));
    let cancel = CancellationToken::new();
    let session = Session::new(
        session_id.clone(),
        principal.clone(),
        sender.clone(),
        cancel.clone(),
    );
    if let Err(err) = engine.pool.add_connection(session) {
        reject(&session_id, &mut sink, &err).await;
        if let Err(err) = engine.authenticator.release(&principal).await {
            debug!(session = %session_id, error = %err, "Release after rejection failed");
        }
        return;
    }

    let writer = spawn_writer(session_id.clone(), sink, receiver, cancel.clone());
    let ctx = SessionContext::new(Arc::clone(&engine), session_id.clone(), principal, sender);

    let close_reason = match attach(&ctx, &mut state).await {
        Ok(()) => read_loop(&ctx, &mut stream, &cancel).await,
        Err(err) => {
            warn!(session = %session_id, error = %err, "Session setup failed");
            ctx.send_error(&err).await;
            format!("setup failed: {err}")
        }
    };

    state.step(ConnectionState::Disconnecting);
    teardown(&ctx, &close_reason).await;

    cancel.cancel();
    drop(ctx);
    if let Err(err) = writer.await {
        warn!(session = %session_id, error = %err, "Writer task failed");
    }
    state.step(ConnectionState::Closed);
    info!(session = %session_id, reason = %close_reason, "Connection closed");
}

/// Join the default room, announce the session and attach default
/// subscriptions.
async fn attach(ctx: &SessionContext, state: &mut StateMachine) -> Result<(), EngineError> {
    let engine = &ctx.engine;
    let org = &ctx.principal.organization_id;
    let default_room = organization_room(org);

    engine
        .rooms
        .join_room(&ctx.session_id, &ctx.principal, &default_room, &[])?;
    engine.presence.set_user_online(&ctx.principal, &ctx.session_id);
    state.step(ConnectionState::JoinedDefaultRoom);

    ctx.send(ServerMessage::Connected {
        connection_id: ctx.session_id.clone(),
        user_id: ctx.principal.user_id.clone(),
        organization_id: org.clone(),
        capabilities: capabilities(),
        timestamp: unix_millis(),
    })
    .await;

    // No room filter: follows whatever rooms the session joins later.
    let request = SubscriptionRequest {
        event_types: DEFAULT_EVENT_TYPES.iter().map(|t| t.to_string()).collect(),
        rooms: Vec::new(),
        filters: None,
    };
    engine.subscriber.subscribe(&ctx.session_id, request).await?;

    ctx.record_activity("session.connected", None, serde_json::Value::Null);
    state.step(ConnectionState::Active);

    if engine.is_shutting_down() {
        ctx.send(ServerMessage::server_shutdown(
            "Server is shutting down",
            unix_millis(),
        ))
        .await;
    }
    Ok(())
}

async fn read_loop(
    ctx: &SessionContext,
    stream: &mut Box<dyn MessageStream>,
    cancel: &CancellationToken,
) -> String {
    let table = DispatchTable::new();
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                return if ctx.engine.is_shutting_down() {
                    "server shutdown".to_string()
                } else {
                    "closed by server".to_string()
                };
            }
            received = stream.recv() => received,
        };

        match received {
            Ok(Some(message)) => {
                if let Some(reason) = ctx.handle(&table, message).await {
                    return reason;
                }
            }
            Ok(None) => return "connection closed".to_string(),
            Err(err) if err.is_recoverable() => {
                debug!(session = %ctx.session_id, error = %err, "Malformed message");
                metrics::record_error(codes::PROTOCOL_ERROR);
                ctx.send(ServerMessage::error(codes::PROTOCOL_ERROR, err.to_string()))
                    .await;
            }
            Err(err) => {
                debug!(session = %ctx.session_id, error = %err, "Transport error");
                return format!("transport error: {err}");
            }
        }
    }
}

fn log_step(session: &str, step: &str, err: &EngineError) {
    if err.is_benign() {
        debug!(session = %session, step, error = %err, "Teardown step skipped");
    } else {
        warn!(session = %session, step, error = %err, "Teardown step failed");
    }
}

/// Release everything the session holds. Every step runs even when an
/// earlier one failed.
async fn teardown(ctx: &SessionContext, reason: &str) {
    let engine = &ctx.engine;
    let session = ctx.session_id.as_str();
    let principal = &ctx.principal;

    if engine.pool.remove_connection(session).is_none() {
        log_step(
            session,
            "pool",
            &EngineError::SessionNotFound(session.to_string()),
        );
    }
    let left = engine.rooms.leave_all(session);
    debug!(session = %session, rooms = left.len(), "Left rooms");

    if let Err(err) =
        engine
            .presence
            .set_user_offline(&principal.organization_id, &principal.user_id, session)
    {
        log_step(session, "presence", &err);
    }

    if let Err(err) = engine.subscriber.unsubscribe(session) {
        log_step(session, "subscriptions", &err);
    }
    engine.stream.unsubscribe_session(session);

    if let Err(err) = engine.authenticator.release(principal).await {
        log_step(session, "auth", &err);
    }

    ctx.record_activity(
        "session.disconnected",
        None,
        serde_json::json!({ "reason": reason }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{
        connect, next, next_matching, next_reply, test_config, test_engine,
    };
    use beacon_core::{PresenceStatus, Role};
    use beacon_protocol::ActivityFilters;
    use beacon_transport::memory::{pair, pair_with_credential};
    use beacon_transport::ConnectionId;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_state_transitions() {
        let mut machine = StateMachine::new("s1");
        assert!(machine.advance(ConnectionState::Active).is_err());
        assert_eq!(machine.state(), ConnectionState::Connecting);

        for next in [
            ConnectionState::Authenticated,
            ConnectionState::JoinedDefaultRoom,
            ConnectionState::Active,
            ConnectionState::Disconnecting,
            ConnectionState::Closed,
        ] {
            machine.advance(next).unwrap();
        }
        assert!(machine.advance(ConnectionState::Active).is_err());
    }

    #[test]
    fn test_early_disconnect_allowed() {
        assert!(ConnectionState::Connecting.can_transition(ConnectionState::Disconnecting));
        assert!(ConnectionState::Authenticated.can_transition(ConnectionState::Disconnecting));
        assert!(!ConnectionState::Closed.can_transition(ConnectionState::Disconnecting));
        assert!(!ConnectionState::Active.can_transition(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let engine = test_engine(test_config()).await;
        let (connection, mut client) =
            pair_with_credential(ConnectionId::generate(), Some("nope".to_string()));
        engine.handle_connection(Box::new(connection)).await;

        match next(&mut client).await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, codes::UNAUTHORIZED),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(next(&mut client).await, None);
        assert!(engine.pool.is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_is_rejected() {
        let engine = test_engine(test_config()).await;
        let (connection, mut client) = pair(ConnectionId::generate());
        engine.handle_connection(Box::new(connection)).await;

        match next(&mut client).await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, codes::UNAUTHORIZED),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connected_joins_default_room() {
        let engine = test_engine(test_config()).await;
        let (connection, mut client) =
            pair_with_credential("conn_alice", Some("token-alice".to_string()));
        engine.spawn_connection(Box::new(connection));

        match next(&mut client).await {
            Some(ServerMessage::Connected {
                connection_id,
                user_id,
                organization_id,
                capabilities,
                ..
            }) => {
                assert_eq!(connection_id, "conn_alice");
                assert_eq!(user_id, "alice");
                assert_eq!(organization_id, "acme");
                assert!(capabilities.contains(&"collaborate_dashboard".to_string()));
            }
            other => panic!("expected connected, got {other:?}"),
        }
        assert!(engine.rooms.is_member("conn_alice", "org:acme"));
        assert_eq!(engine.subscriber.subscription_count("conn_alice"), 1);
        let presence = engine.presence.get_user_presence("acme", "alice").unwrap();
        assert_eq!(presence.status, PresenceStatus::Online);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_room_respects_organization() {
        let engine = test_engine(test_config()).await;
        let (session, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::join_room("dashboard:acme:sales"))
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut client).await,
            Some(ServerMessage::room_joined("dashboard:acme:sales"))
        );
        assert!(engine.rooms.is_member(&session, "dashboard:acme:sales"));

        client
            .send(ClientMessage::join_room("dashboard:globex:sales"))
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::RoomJoinResult { success, error, .. }) => {
                assert!(!success);
                assert!(error.is_some());
            }
            other => panic!("expected room_join_result, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_room() {
        let engine = test_engine(test_config()).await;
        let (session, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::join_room("custom:acme:ops"))
            .await
            .unwrap();
        next_reply(&mut client).await;
        client
            .send(ClientMessage::leave_room("custom:acme:ops"))
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut client).await,
            Some(ServerMessage::RoomLeft {
                room: "custom:acme:ops".to_string()
            })
        );
        assert!(!engine.rooms.is_member(&session, "custom:acme:ops"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_collaboration_reaches_room_peers_only() {
        let engine = test_engine(test_config()).await;
        let (_, mut alice) = connect(&engine, "token-alice").await;
        let (_, mut bob) = connect(&engine, "token-bob").await;
        let (_, mut erin) = connect(&engine, "token-erin").await;

        for client in [&mut alice, &mut bob] {
            client
                .send(ClientMessage::join_room("dashboard:acme:sales"))
                .await
                .unwrap();
            next_matching(client, |m| matches!(m, ServerMessage::RoomJoinResult { .. })).await;
        }

        alice
            .send(ClientMessage::CollaborateDashboard {
                dashboard_id: "sales".to_string(),
                action: "cursor".to_string(),
                collaborative_data: json!({"x": 10, "y": 20}),
            })
            .await
            .unwrap();

        let event = next_matching(&mut bob, |m| {
            matches!(m, ServerMessage::Event { event_type, .. } if event_type == "dashboard.collaboration")
        })
        .await;
        match event {
            ServerMessage::Event { room, user_id, payload, .. } => {
                assert_eq!(room, "dashboard:acme:sales");
                assert_eq!(user_id.as_deref(), Some("alice"));
                assert_eq!(payload["action"], "cursor");
                assert_eq!(payload["data"]["x"], 10);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Erin never joined the dashboard room.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Some(message) = erin.try_recv() {
            assert!(!matches!(
                message,
                ServerMessage::Event { ref event_type, .. } if event_type == "dashboard.collaboration"
            ));
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_collaboration_requires_membership() {
        let engine = test_engine(test_config()).await;
        let (_, mut alice) = connect(&engine, "token-alice").await;

        alice
            .send(ClientMessage::CollaborateDashboard {
                dashboard_id: "sales".to_string(),
                action: "edit".to_string(),
                collaborative_data: json!({}),
            })
            .await
            .unwrap();
        match next_reply(&mut alice).await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, codes::UNAUTHORIZED),
            other => panic!("expected error, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_pong() {
        let engine = test_engine(test_config()).await;
        let (_, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::Heartbeat {
                timestamp: Some(42),
            })
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut client).await,
            Some(ServerMessage::Pong {
                timestamp: Some(42)
            })
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_presence_status_override() {
        let engine = test_engine(test_config()).await;
        let (_, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::SetPresenceStatus {
                status: "dnd".to_string(),
                custom_message: Some("focus".to_string()),
            })
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::PresenceStatusResult { success, status, .. }) => {
                assert!(success);
                assert_eq!(status.as_deref(), Some("busy"));
            }
            other => panic!("expected presence_status_result, got {other:?}"),
        }

        client
            .send(ClientMessage::SetPresenceStatus {
                status: "sleeping".to_string(),
                custom_message: None,
            })
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::PresenceStatusResult { success, error, .. }) => {
                assert!(!success);
                assert!(error.is_some());
            }
            other => panic!("expected presence_status_result, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_activity_feed_lists_session_activity() {
        let engine = test_engine(test_config()).await;
        let (_, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::join_room("dashboard:acme:sales"))
            .await
            .unwrap();
        next_reply(&mut client).await;

        client
            .send(ClientMessage::GetActivityFeed {
                limit: Some(10),
                offset: None,
                filters: Some(ActivityFilters {
                    user_id: Some("alice".to_string()),
                    action: None,
                }),
            })
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::ActivityFeed { items, total, has_more }) => {
                assert_eq!(total, 2);
                assert!(!has_more);
                let actions: Vec<_> = items.iter().map(|i| i["action"].clone()).collect();
                assert!(actions.contains(&json!("room.joined")));
                assert!(actions.contains(&json!("session.connected")));
            }
            other => panic!("expected activity_feed, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_metric_subscription_receives_updates() {
        let engine = test_engine(test_config()).await;
        let (session, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::SubscribeMetrics {
                metric_name: "cpu.load".to_string(),
                options: None,
            })
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::MetricsSubscriptionResult { metric_name, accepted, .. }) => {
                assert_eq!(metric_name, "cpu.load");
                assert!(accepted);
            }
            other => panic!("expected metrics_subscription_result, got {other:?}"),
        }
        assert!(engine.rooms.is_member(&session, "custom:acme:metric.cpu.load"));

        client
            .send(ClientMessage::publish_metric("cpu.load", 0.75))
            .await
            .unwrap();
        let update = next_matching(&mut client, |m| {
            matches!(m, ServerMessage::Event { event_type, .. } if event_type == "metric.update")
        })
        .await;
        match update {
            ServerMessage::Event { room, .. } => {
                assert_eq!(room, "custom:acme:metric.cpu.load");
            }
            other => panic!("unexpected {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_events_to_unjoined_room_fails() {
        let engine = test_engine(test_config()).await;
        let (_, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::subscribe_events(
                vec!["metric.update".to_string()],
                vec!["custom:acme:elsewhere".to_string()],
            ))
            .await
            .unwrap();
        match next_reply(&mut client).await {
            Some(ServerMessage::SubscriptionResult { accepted, error, .. }) => {
                assert!(!accepted);
                assert!(error.is_some());
            }
            other => panic!("expected subscription_result, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_user_cap() {
        let mut config = test_config();
        config.pool.max_connections_per_user = 1;
        let engine = test_engine(config).await;
        let _first = connect(&engine, "token-alice").await;

        let (connection, mut client) =
            pair_with_credential(ConnectionId::generate(), Some("token-alice".to_string()));
        engine.handle_connection(Box::new(connection)).await;
        match next_reply(&mut client).await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, codes::CAPACITY_EXCEEDED),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(engine.pool.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_session() {
        let engine = test_engine(test_config()).await;
        let (session, mut client) = connect(&engine, "token-alice").await;

        client
            .send(ClientMessage::Disconnect {
                reason: "bye".to_string(),
            })
            .await
            .unwrap();
        while next(&mut client).await.is_some() {}

        assert!(!engine.pool.contains(&session));
        assert!(engine.rooms.rooms_for(&session).is_empty());
        assert_eq!(engine.subscriber.subscription_count(&session), 0);
        let presence = engine.presence.get_user_presence("acme", "alice").unwrap();
        assert_eq!(presence.status, PresenceStatus::Offline);
        // The auth session was already released.
        let alice = Principal::new("alice", "acme", Role::Member, "ALICE");
        assert!(engine.authenticator.release(&alice).await.is_err());

        let page = engine.activity.get_feed(
            "acme",
            None,
            None,
            Some(&ActivityFilters {
                user_id: None,
                action: Some("session.disconnected".to_string()),
            }),
        );
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].metadata["reason"], "bye");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_presence_fans_out_to_organization() {
        let engine = test_engine(test_config()).await;
        let (_, mut alice) = connect(&engine, "token-alice").await;
        let (_, mut bob) = connect(&engine, "token-bob").await;

        bob.send(ClientMessage::SetPresenceStatus {
            status: "away".to_string(),
            custom_message: None,
        })
        .await
        .unwrap();

        let event = next_matching(&mut alice, |m| {
            matches!(m, ServerMessage::Event { event_type, user_id, .. }
                if event_type == "presence.changed" && user_id.as_deref() == Some("bob"))
        })
        .await;
        assert!(matches!(event, ServerMessage::Event { replayed: false, .. }));
        engine.shutdown().await;
    }
}
