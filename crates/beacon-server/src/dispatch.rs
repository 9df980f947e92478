//! Inbound message dispatch.
//!
//! Each session builds one [`DispatchTable`] mapping every inbound message
//! type to its handler.

use beacon_core::event::event_types;
use beacon_core::room::{parse_room_id, room_id};
use beacon_core::{unix_millis, EngineError, Event, MetricSample, RoomScope, SubscriptionRequest};
use beacon_protocol::{ClientMessage, MessageType, ServerMessage};
use futures_util::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::session::{Outcome, SessionContext};

type HandlerResult = Result<Outcome, EngineError>;

/// A message handler.
pub type Handler = for<'a> fn(&'a SessionContext, ClientMessage) -> BoxFuture<'a, HandlerResult>;

/// Message type to handler.
pub struct DispatchTable {
    handlers: HashMap<MessageType, Handler>,
}

impl DispatchTable {
    /// Table with a handler for every inbound message type.
    #[must_use]
    pub fn new() -> Self {
        let mut handlers: HashMap<MessageType, Handler> = HashMap::with_capacity(10);
        handlers.insert(MessageType::JoinRoom, join_room);
        handlers.insert(MessageType::LeaveRoom, leave_room);
        handlers.insert(MessageType::SubscribeEvents, subscribe_events);
        handlers.insert(MessageType::SubscribeMetrics, subscribe_metrics);
        handlers.insert(MessageType::SetPresenceStatus, set_presence_status);
        handlers.insert(MessageType::GetActivityFeed, get_activity_feed);
        handlers.insert(MessageType::CollaborateDashboard, collaborate_dashboard);
        handlers.insert(MessageType::PublishMetric, publish_metric);
        handlers.insert(MessageType::Heartbeat, heartbeat);
        handlers.insert(MessageType::Disconnect, disconnect);
        Self { handlers }
    }

    /// Whether a handler is registered.
    #[must_use]
    pub fn handles(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Run the handler for a message.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns, or `InvalidMessage` when no
    /// handler is registered.
    pub async fn dispatch(&self, ctx: &SessionContext, message: ClientMessage) -> HandlerResult {
        let message_type = message.message_type();
        match self.handlers.get(&message_type) {
            Some(handler) => handler(ctx, message).await,
            None => Err(EngineError::InvalidMessage(format!(
                "no handler for {message_type}"
            ))),
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatched(expected: MessageType) -> EngineError {
    EngineError::InvalidMessage(format!("handler for {expected} received another message"))
}

fn publish(ctx: &SessionContext, event: Event) {
    let event_type = event.event_type.clone();
    if let Err(err) = ctx.engine.publisher.publish(event) {
        warn!(session = %ctx.session_id, event_type = %event_type, error = %err, "Failed to publish event");
    }
}

fn membership_event(ctx: &SessionContext, event_type: &str, room: &str) -> Event {
    let principal = &ctx.principal;
    Event::new(
        event_type,
        principal.organization_id.clone(),
        json!({
            "userId": principal.user_id,
            "displayName": principal.display_name,
            "sessionId": ctx.session_id,
            "room": room,
            "at": unix_millis(),
        }),
    )
    .with_user(principal.user_id.clone())
    .with_room(room)
}

fn join_room(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::JoinRoom { room, permissions } = message else {
            return Err(mismatched(MessageType::JoinRoom));
        };
        let permissions = permissions.unwrap_or_default();
        let rooms = &ctx.engine.rooms;
        let already_member = rooms.is_member(&ctx.session_id, &room);

        match rooms.join_room(&ctx.session_id, &ctx.principal, &room, &permissions) {
            Ok(()) => {
                if !already_member {
                    publish(ctx, membership_event(ctx, event_types::MEMBER_JOINED, &room));
                    ctx.record_activity("room.joined", Some(room.as_str()), serde_json::Value::Null);
                }
                Ok(Outcome::Reply(ServerMessage::room_joined(room)))
            }
            Err(err) => Ok(Outcome::Refused(
                ServerMessage::RoomJoinResult {
                    room,
                    success: false,
                    error: Some(err.to_string()),
                },
                err,
            )),
        }
    })
}

fn leave_room(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::LeaveRoom { room } = message else {
            return Err(mismatched(MessageType::LeaveRoom));
        };
        if ctx.engine.rooms.leave_room(&ctx.session_id, &room) {
            publish(ctx, membership_event(ctx, event_types::MEMBER_LEFT, &room));
        } else {
            debug!(session = %ctx.session_id, room = %room, "Leave for a room the session was not in");
        }
        Ok(Outcome::Reply(ServerMessage::RoomLeft { room }))
    })
}

fn subscribe_events(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::SubscribeEvents {
            event_types,
            rooms,
            filters,
        } = message
        else {
            return Err(mismatched(MessageType::SubscribeEvents));
        };
        let request = SubscriptionRequest {
            event_types,
            rooms,
            filters,
        };

        match ctx.engine.subscriber.subscribe(&ctx.session_id, request).await {
            Ok(outcome) => Ok(Outcome::Reply(ServerMessage::SubscriptionResult {
                accepted: true,
                subscription_id: Some(outcome.subscription_id),
                replayed: outcome.replayed,
                error: None,
            })),
            Err(err) => Ok(Outcome::Refused(
                ServerMessage::SubscriptionResult {
                    accepted: false,
                    subscription_id: None,
                    replayed: 0,
                    error: Some(err.to_string()),
                },
                err,
            )),
        }
    })
}

fn subscribe_metrics(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::SubscribeMetrics {
            metric_name,
            options,
        } = message
        else {
            return Err(mismatched(MessageType::SubscribeMetrics));
        };
        let options = options.unwrap_or_default();
        let engine = &ctx.engine;

        let refuse = |metric_name: String, err: EngineError| {
            Outcome::Refused(
                ServerMessage::MetricsSubscriptionResult {
                    metric_name,
                    accepted: false,
                    snapshot: None,
                    error: Some(err.to_string()),
                },
                err,
            )
        };

        let subscription = match engine.stream.subscribe_to_metric(
            &ctx.principal.organization_id,
            &metric_name,
            &ctx.session_id,
            &options,
        ) {
            Ok(subscription) => subscription,
            Err(err) => return Ok(refuse(metric_name, err)),
        };

        if let Err(err) =
            engine
                .rooms
                .join_room(&ctx.session_id, &ctx.principal, &subscription.room, &[])
        {
            return Ok(refuse(metric_name, err));
        }

        let request = SubscriptionRequest {
            event_types: vec![event_types::METRIC_UPDATE.to_string()],
            rooms: vec![subscription.room.clone()],
            filters: None,
        };
        if let Err(err) = engine.subscriber.subscribe(&ctx.session_id, request).await {
            return Ok(refuse(metric_name, err));
        }

        let snapshot = subscription
            .snapshot
            .and_then(|snapshot| serde_json::to_value(snapshot).ok());
        Ok(Outcome::Reply(ServerMessage::MetricsSubscriptionResult {
            metric_name,
            accepted: subscription.accepted,
            snapshot,
            error: None,
        }))
    })
}

fn set_presence_status(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::SetPresenceStatus {
            status,
            custom_message,
        } = message
        else {
            return Err(mismatched(MessageType::SetPresenceStatus));
        };
        let principal = &ctx.principal;

        match ctx.engine.presence.set_user_status(
            &principal.organization_id,
            &principal.user_id,
            &status,
            custom_message,
        ) {
            Ok(visible) => Ok(Outcome::Reply(ServerMessage::PresenceStatusResult {
                success: true,
                status: Some(visible.as_str().to_string()),
                error: None,
            })),
            Err(err) => Ok(Outcome::Refused(
                ServerMessage::PresenceStatusResult {
                    success: false,
                    status: None,
                    error: Some(err.to_string()),
                },
                err,
            )),
        }
    })
}

fn get_activity_feed(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::GetActivityFeed {
            limit,
            offset,
            filters,
        } = message
        else {
            return Err(mismatched(MessageType::GetActivityFeed));
        };

        let page = ctx.engine.activity.get_feed(
            &ctx.principal.organization_id,
            limit,
            offset,
            filters.as_ref(),
        );
        let items = page
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| EngineError::InvalidMessage(err.to_string()))?;

        Ok(Outcome::Reply(ServerMessage::ActivityFeed {
            items,
            total: page.total,
            has_more: page.has_more,
        }))
    })
}

fn collaborate_dashboard(
    ctx: &SessionContext,
    message: ClientMessage,
) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::CollaborateDashboard {
            dashboard_id,
            action,
            collaborative_data,
        } = message
        else {
            return Err(mismatched(MessageType::CollaborateDashboard));
        };
        let principal = &ctx.principal;
        let room = room_id(RoomScope::Dashboard, &principal.organization_id, &dashboard_id);
        parse_room_id(&room)?;

        if !ctx.engine.rooms.is_member(&ctx.session_id, &room) {
            return Err(EngineError::Unauthorized(format!(
                "session has not joined {room}"
            )));
        }

        let event = Event::new(
            event_types::DASHBOARD_COLLABORATION,
            principal.organization_id.clone(),
            json!({
                "dashboardId": dashboard_id,
                "action": action,
                "data": collaborative_data,
                "userId": principal.user_id,
                "displayName": principal.display_name,
                "sessionId": ctx.session_id,
                "at": unix_millis(),
            }),
        )
        .with_user(principal.user_id.clone())
        .with_room(room.clone());
        ctx.engine.publisher.publish(event)?;

        ctx.record_activity(
            "dashboard.collaboration",
            Some(room.as_str()),
            json!({ "action": action }),
        );
        Ok(Outcome::Silent)
    })
}

fn publish_metric(ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::PublishMetric {
            name,
            value,
            kind,
            tags,
        } = message
        else {
            return Err(mismatched(MessageType::PublishMetric));
        };
        let sample = MetricSample::new(ctx.principal.organization_id.clone(), name, value)
            .with_kind(kind)
            .with_tags(tags);
        ctx.engine.stream.stream_metric(sample)?;
        Ok(Outcome::Silent)
    })
}

fn heartbeat(_ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::Heartbeat { timestamp } = message else {
            return Err(mismatched(MessageType::Heartbeat));
        };
        // Liveness was already refreshed by the session loop.
        Ok(Outcome::Reply(ServerMessage::Pong { timestamp }))
    })
}

fn disconnect(_ctx: &SessionContext, message: ClientMessage) -> BoxFuture<'_, HandlerResult> {
    Box::pin(async move {
        let ClientMessage::Disconnect { reason } = message else {
            return Err(mismatched(MessageType::Disconnect));
        };
        if reason.is_empty() {
            Ok(Outcome::Close("client disconnect".to_string()))
        } else {
            Ok(Outcome::Close(reason))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{test_config, test_engine};
    use crate::engine::Engine;
    use beacon_core::{Principal, Role, Session};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// A session admitted to the pool and marked online, with no transport.
    fn session(
        engine: &Arc<Engine>,
        user: &str,
        org: &str,
    ) -> (SessionContext, mpsc::Receiver<ServerMessage>) {
        let principal = Principal::new(user, org, Role::Member, user.to_uppercase());
        let session_id = format!("conn_{user}");
        let (sender, receiver) = mpsc::channel(16);
        engine
            .pool
            .add_connection(Session::new(
                session_id.clone(),
                principal.clone(),
                sender.clone(),
                CancellationToken::new(),
            ))
            .unwrap();
        engine.presence.set_user_online(&principal, &session_id);
        let ctx = SessionContext::new(Arc::clone(engine), session_id, principal, sender);
        (ctx, receiver)
    }

    fn collaborate(dashboard_id: &str) -> ClientMessage {
        ClientMessage::CollaborateDashboard {
            dashboard_id: dashboard_id.to_string(),
            action: "cursor".to_string(),
            collaborative_data: json!({ "x": 10, "y": 20 }),
        }
    }

    fn feed(limit: usize, offset: usize) -> ClientMessage {
        ClientMessage::GetActivityFeed {
            limit: Some(limit),
            offset: Some(offset),
            filters: None,
        }
    }

    #[test]
    fn test_every_message_type_is_handled() {
        let table = DispatchTable::new();
        for message_type in MessageType::ALL {
            assert!(table.handles(message_type), "{message_type} has no handler");
        }
    }

    #[test]
    fn test_mismatched_message_error() {
        let err = mismatched(MessageType::Heartbeat);
        assert_eq!(err.code(), "INVALID_MESSAGE");
        assert!(err.to_string().contains("heartbeat"));
    }

    #[tokio::test]
    async fn test_collaborate_rejects_malformed_dashboard() {
        let engine = test_engine(test_config()).await;
        let table = DispatchTable::new();
        let (alice, _rx) = session(&engine, "alice", "acme");

        for dashboard_id in ["", "ops\u{7}"] {
            let result = table.dispatch(&alice, collaborate(dashboard_id)).await;
            assert!(
                matches!(result, Err(EngineError::InvalidRoom(_))),
                "{dashboard_id:?} was accepted"
            );
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_collaborate_requires_membership() {
        let engine = test_engine(test_config()).await;
        let table = DispatchTable::new();
        let (alice, _alice_rx) = session(&engine, "alice", "acme");
        let (carol, _carol_rx) = session(&engine, "carol", "globex");
        engine
            .rooms
            .join_room(&carol.session_id, &carol.principal, "dashboard:globex:ops", &[])
            .unwrap();

        // Neither the bare key nor a smuggled organization reaches globex
        for dashboard_id in ["ops", "globex:ops"] {
            let result = table.dispatch(&alice, collaborate(dashboard_id)).await;
            assert!(
                matches!(result, Err(EngineError::Unauthorized(_))),
                "{dashboard_id:?} was accepted"
            );
        }

        engine
            .rooms
            .join_room(&alice.session_id, &alice.principal, "dashboard:acme:ops", &[])
            .unwrap();
        let result = table.dispatch(&alice, collaborate("ops")).await;
        assert!(matches!(result, Ok(Outcome::Silent)));

        let page = engine.activity.get_feed("acme", None, None, None);
        assert!(page
            .items
            .iter()
            .any(|item| item.action == "dashboard.collaboration"));
        assert!(engine.activity.get_feed("globex", None, None, None).items.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_metric_rejects_non_finite_values() {
        let engine = test_engine(test_config()).await;
        let table = DispatchTable::new();
        let (alice, _rx) = session(&engine, "alice", "acme");

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = table
                .dispatch(&alice, ClientMessage::publish_metric("cpu.usage", value))
                .await;
            assert!(
                matches!(result, Err(EngineError::InvalidMessage(_))),
                "{value} was accepted"
            );
        }
        assert!(engine.stream.get_real_time_metrics("acme").is_empty());

        let result = table
            .dispatch(&alice, ClientMessage::publish_metric("cpu.usage", 42.5))
            .await;
        assert!(matches!(result, Ok(Outcome::Silent)));
        assert_eq!(engine.stream.get_real_time_metrics("acme").len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_presence_status_is_refused() {
        let engine = test_engine(test_config()).await;
        let table = DispatchTable::new();
        let (alice, _rx) = session(&engine, "alice", "acme");

        let sleeping = ClientMessage::SetPresenceStatus {
            status: "sleeping".to_string(),
            custom_message: None,
        };
        match table.dispatch(&alice, sleeping).await {
            Ok(Outcome::Refused(
                ServerMessage::PresenceStatusResult {
                    success,
                    status,
                    error,
                },
                err,
            )) => {
                assert!(!success);
                assert!(status.is_none());
                assert!(error.unwrap().contains("sleeping"));
                assert_eq!(err.code(), "INVALID_MESSAGE");
            }
            other => panic!("expected a refusal, got {other:?}"),
        }

        let dnd = ClientMessage::SetPresenceStatus {
            status: "dnd".to_string(),
            custom_message: Some("heads down".to_string()),
        };
        match table.dispatch(&alice, dnd).await {
            Ok(Outcome::Reply(ServerMessage::PresenceStatusResult {
                success, status, ..
            })) => {
                assert!(success);
                assert_eq!(status.as_deref(), Some("busy"));
            }
            other => panic!("expected a reply, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_activity_feed_paging_past_the_end() {
        let engine = test_engine(test_config()).await;
        let table = DispatchTable::new();
        let (alice, _rx) = session(&engine, "alice", "acme");
        for n in 0..3 {
            alice.record_activity("dashboard.view", Some("dashboard:acme:ops"), json!({ "n": n }));
        }

        let total = match table.dispatch(&alice, feed(10, 0)).await {
            Ok(Outcome::Reply(ServerMessage::ActivityFeed {
                items,
                total,
                has_more,
            })) => {
                assert_eq!(items.len(), total);
                assert!(!has_more);
                total
            }
            other => panic!("expected a feed, got {other:?}"),
        };
        assert!(total >= 3);

        match table.dispatch(&alice, feed(10, total + 5)).await {
            Ok(Outcome::Reply(ServerMessage::ActivityFeed {
                items,
                total: after,
                has_more,
            })) => {
                assert!(items.is_empty());
                assert_eq!(after, total);
                assert!(!has_more);
            }
            other => panic!("expected a feed, got {other:?}"),
        }
        engine.shutdown().await;
    }
}
