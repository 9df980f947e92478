//! Dead-letter store for events that exhausted publish retries.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::event::Event;
use crate::unix_millis;

/// An event that could not be published.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: Arc<Event>,
    pub error: String,
    pub attempts: u32,
    pub failed_at: u64,
    #[serde(skip)]
    stored_at: Instant,
}

/// Bounded in-memory dead-letter store with a retention window.
#[derive(Debug)]
pub struct DeadLetterStore {
    entries: Mutex<VecDeque<DeadLetter>>,
    retention: Duration,
    max_entries: usize,
}

impl DeadLetterStore {
    /// Create a store.
    #[must_use]
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retention,
            max_entries: max_entries.max(1),
        }
    }

    /// Record a failed event. The oldest entry is evicted when full.
    pub fn push(&self, event: Arc<Event>, error: impl Into<String>, attempts: u32) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            event,
            error: error.into(),
            attempts,
            failed_at: unix_millis(),
            stored_at: Instant::now(),
        });
    }

    /// Drop entries older than the retention window.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| now.duration_since(e.stored_at) < self.retention);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Arc<Event> {
        Arc::new(Event::new("system.notice", "acme", json!({})))
    }

    #[test]
    fn test_push_is_bounded() {
        let store = DeadLetterStore::new(Duration::from_secs(60), 2);
        let first = event();
        store.push(Arc::clone(&first), "down", 3);
        store.push(event(), "down", 3);
        store.push(event(), "down", 3);

        assert_eq!(store.len(), 2);
        assert!(store.snapshot().iter().all(|d| d.event.id != first.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_after_retention() {
        let store = DeadLetterStore::new(Duration::from_secs(60), 10);
        store.push(event(), "down", 3);

        tokio::time::advance(Duration::from_secs(30)).await;
        store.push(event(), "down", 3);
        assert_eq!(store.prune(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.prune(), 1);
        assert_eq!(store.len(), 1);
    }
}
