//! Bounded per-room history used to backfill reconnecting sessions.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::event::Event;
use crate::room::RoomId;

/// One buffered delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// Global arrival order.
    pub seq: u64,
    pub event: Arc<Event>,
    pub delivered_at: Instant,
}

/// Ring buffer of recent deliveries per room.
#[derive(Debug)]
pub struct ReplayBuffer {
    rooms: DashMap<RoomId, VecDeque<DeliveryRecord>>,
    capacity: usize,
    retention: Duration,
    seq: AtomicU64,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` records per room, each for
    /// at most `retention`.
    #[must_use]
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity: capacity.max(1),
            retention,
            seq: AtomicU64::new(0),
        }
    }

    /// Record an event against its target room.
    pub fn record(&self, event: Arc<Event>) {
        let mut records = self.rooms.entry(event.room.clone()).or_default();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(DeliveryRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
            delivered_at: Instant::now(),
        });
    }

    /// Events recorded in `rooms` after `after`, in original order.
    ///
    /// At most `limit` records are returned; when more qualify, the most
    /// recent ones are kept.
    #[must_use]
    pub fn since(&self, rooms: &[RoomId], after: Instant, limit: usize) -> Vec<Arc<Event>> {
        let now = Instant::now();
        let mut records: Vec<DeliveryRecord> = Vec::new();

        for room in rooms {
            if let Some(buffer) = self.rooms.get(room) {
                records.extend(
                    buffer
                        .iter()
                        .filter(|r| {
                            r.delivered_at > after
                                && now.duration_since(r.delivered_at) <= self.retention
                        })
                        .cloned(),
                );
            }
        }

        records.sort_by_key(|r| r.seq);
        let skip = records.len().saturating_sub(limit);
        records.into_iter().skip(skip).map(|r| r.event).collect()
    }

    /// Drop records older than the retention window and empty rooms.
    pub fn prune(&self) {
        let now = Instant::now();
        self.rooms.retain(|_, records| {
            while records
                .front()
                .is_some_and(|r| now.duration_since(r.delivered_at) > self.retention)
            {
                records.pop_front();
            }
            !records.is_empty()
        });
    }

    /// Total buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.iter().map(|r| r.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rooms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(room: &str, n: u32) -> Arc<Event> {
        Arc::new(Event::new("system.notice", "acme", json!({ "n": n })).with_room(room))
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_merges_rooms_in_order() {
        let buffer = ReplayBuffer::new(100, Duration::from_secs(300));
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;

        buffer.record(event("org:acme", 0));
        buffer.record(event("dashboard:acme:ops", 1));
        buffer.record(event("org:acme", 2));
        buffer.record(event("custom:acme:other", 3));

        let rooms = vec!["org:acme".to_string(), "dashboard:acme:ops".to_string()];
        let replayed: Vec<_> = buffer
            .since(&rooms, start, 10)
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(replayed, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_and_limit() {
        let buffer = ReplayBuffer::new(3, Duration::from_secs(300));
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;

        for n in 0..5 {
            buffer.record(event("org:acme", n));
        }
        assert_eq!(buffer.len(), 3);

        let rooms = vec!["org:acme".to_string()];
        let replayed: Vec<_> = buffer
            .since(&rooms, start, 2)
            .iter()
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(replayed, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention() {
        let buffer = ReplayBuffer::new(10, Duration::from_secs(60));
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        buffer.record(event("org:acme", 0));

        tokio::time::advance(Duration::from_secs(61)).await;
        let rooms = vec!["org:acme".to_string()];
        assert!(buffer.since(&rooms, start, 10).is_empty());

        buffer.prune();
        assert!(buffer.is_empty());
    }
}
