//! Service health records.
//!
//! Records are recomputed on every health-check tick and replaced wholesale;
//! a record is never patched in place.

use dashmap::DashMap;
use serde::Serialize;

use crate::unix_millis;

/// Health of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health record for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub last_check: u64,
    pub errors: Vec<String>,
}

impl ServiceHealth {
    /// A healthy record checked now.
    #[must_use]
    pub fn healthy(service: impl Into<String>) -> Self {
        Self::with_status(service, HealthStatus::Healthy, Vec::new())
    }

    /// A degraded record checked now.
    #[must_use]
    pub fn degraded(service: impl Into<String>, errors: Vec<String>) -> Self {
        Self::with_status(service, HealthStatus::Degraded, errors)
    }

    /// An unhealthy record checked now.
    #[must_use]
    pub fn unhealthy(service: impl Into<String>, errors: Vec<String>) -> Self {
        Self::with_status(service, HealthStatus::Unhealthy, errors)
    }

    fn with_status(service: impl Into<String>, status: HealthStatus, errors: Vec<String>) -> Self {
        Self {
            service: service.into(),
            status,
            last_check: unix_millis(),
            errors,
        }
    }
}

/// Latest health record per service.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    records: DashMap<String, ServiceHealth>,
}

impl HealthRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record for a service.
    pub fn replace(&self, record: ServiceHealth) {
        self.records.insert(record.service.clone(), record);
    }

    /// Get the record for a service.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<ServiceHealth> {
        self.records.get(service).map(|r| r.clone())
    }

    /// All records, sorted by service name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.service.cmp(&b.service));
        records
    }

    /// Worst status across services; healthy when nothing has been checked yet.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.records
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}
