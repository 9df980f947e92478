//! Broker adapter.
//!
//! The broker is the single fan-out point across server processes. Delivery
//! is at-least-once; consumers must tolerate duplicates.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::event::Event;

/// Topic carrying every published event.
pub const EVENTS_TOPIC: &str = "beacon.events";

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not accept the operation.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker has been closed.
    #[error("broker closed")]
    Closed,
}

/// Horizontal fan-out adapter.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an event on a topic.
    async fn publish(&self, topic: &str, event: Arc<Event>) -> Result<(), BrokerError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Arc<Event>>, BrokerError>;

    /// Adapter name, for logs and health records.
    fn name(&self) -> &'static str;

    /// Whether the adapter is currently usable.
    fn is_healthy(&self) -> bool;
}

/// Single-process broker over tokio broadcast channels.
pub struct LocalBroker {
    topics: DashMap<String, broadcast::Sender<Arc<Event>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl LocalBroker {
    /// Create a broker whose topics buffer up to `capacity` events per
    /// lagging receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the broker. Later publishes and subscribes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.clear();
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Arc<Event>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, topic: &str, event: Arc<Event>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        // No receivers is not a failure: nobody is listening yet.
        let receivers = self.sender(topic).send(event).unwrap_or(0);
        trace!(topic = %topic, receivers, "Published to local broker");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Arc<Event>>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.sender(topic).subscribe())
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = LocalBroker::default();
        let mut rx = broker.subscribe(EVENTS_TOPIC).await.unwrap();

        let event = Arc::new(Event::new("system.notice", "acme", json!({})));
        broker.publish(EVENTS_TOPIC, Arc::clone(&event)).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, event.id);
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let broker = LocalBroker::default();
        let event = Arc::new(Event::new("system.notice", "acme", json!({})));
        assert!(broker.publish("nobody", event).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_broker() {
        let broker = LocalBroker::default();
        broker.close();

        assert!(!broker.is_healthy());
        assert!(matches!(
            broker.subscribe(EVENTS_TOPIC).await,
            Err(BrokerError::Closed)
        ));
    }
}
