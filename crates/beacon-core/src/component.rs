//! Capability interface shared by every engine component.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::health::ServiceHealth;

/// A long-lived engine component.
///
/// The orchestrator treats all components uniformly through this trait when
/// collecting metrics, running health checks and shutting down.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable component name, used as the health record key.
    fn name(&self) -> &'static str;

    /// Point-in-time metrics snapshot.
    fn metrics(&self) -> serde_json::Value;

    /// Current health.
    fn health(&self) -> ServiceHealth {
        ServiceHealth::healthy(self.name())
    }

    /// Stop background work and release resources.
    async fn shutdown(&self) -> Result<(), EngineError>;
}
