//! Shared fixtures for the Beacon benchmarks.

use beacon_core::room::room_id;
use beacon_core::{
    ConnectionPool, Event, EventSubscriber, OrganizationPolicy, PoolConfig, Principal, Role,
    RoomConfig, RoomManager, RoomScope, Session, SubscriberConfig, SubscriptionRequest,
};
use beacon_protocol::ServerMessage;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Organization used by every fixture.
pub const ORG: &str = "bench";

/// A principal for the `i`-th benchmark user.
#[must_use]
pub fn principal(i: usize) -> Principal {
    Principal::new(format!("user-{i}"), ORG, Role::Member, format!("User {i}"))
}

/// An event addressed to `room` with a payload unique to `seq`.
#[must_use]
pub fn event(room: &str, seq: u64) -> Event {
    Event::new(
        "dashboard.collaboration",
        ORG,
        json!({ "seq": seq, "action": "cursor", "x": 10, "y": 20 }),
    )
    .with_room(room)
}

/// Sessions joined to one dashboard room, each subscribed to
/// collaboration events.
pub struct FanOut {
    pub pool: Arc<ConnectionPool>,
    pub rooms: Arc<RoomManager>,
    pub subscriber: Arc<EventSubscriber>,
    pub room: String,
    receivers: Vec<mpsc::Receiver<ServerMessage>>,
}

impl FanOut {
    /// Build a fan-out of `sessions` subscribers.
    ///
    /// # Panics
    ///
    /// Panics if a session cannot be admitted or subscribed.
    pub async fn new(sessions: usize) -> Self {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_connections: sessions + 1,
            max_connections_per_org: sessions + 1,
            outbound_capacity: 1024,
            ..PoolConfig::default()
        }));
        let rooms = Arc::new(RoomManager::new(
            RoomConfig::default(),
            Arc::new(OrganizationPolicy),
        ));
        let subscriber = Arc::new(EventSubscriber::new(
            Arc::clone(&pool),
            Arc::clone(&rooms),
            SubscriberConfig {
                enable_replay: false,
                ..SubscriberConfig::default()
            },
        ));
        let room = room_id(RoomScope::Dashboard, ORG, "load");

        let mut receivers = Vec::with_capacity(sessions);
        for i in 0..sessions {
            let id = format!("conn_{i}");
            let user = principal(i);
            let (sender, receiver) = mpsc::channel(1024);
            pool.add_connection(Session::new(
                id.clone(),
                user.clone(),
                sender,
                CancellationToken::new(),
            ))
            .expect("admit session");
            rooms
                .join_room(&id, &user, &room, &[])
                .expect("join room");
            subscriber
                .subscribe(
                    &id,
                    SubscriptionRequest {
                        event_types: vec!["dashboard.collaboration".to_string()],
                        rooms: vec![room.clone()],
                        filters: None,
                    },
                )
                .await
                .expect("subscribe");
            receivers.push(receiver);
        }

        Self {
            pool,
            rooms,
            subscriber,
            room,
            receivers,
        }
    }

    /// Empty every session queue. Returns the number of messages drained.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for receiver in &mut self.receivers {
            while receiver.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
