//! Health status types and aggregation

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Component or overall health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Working normally
    Healthy,
    /// Working, but with reduced capacity or growing lag
    Degraded,
    /// Not working; traffic should not be routed here
    Unhealthy,
    /// Not yet determined
    Unknown,
}

impl HealthStatus {
    /// Readiness answer for this status.
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Overall status of a set of component results.
    ///
    /// Any Unhealthy component makes the whole Unhealthy. If every component
    /// is Healthy or Degraded the whole is Healthy. Anything else is Unknown.
    pub fn aggregate<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        let mut all_ok = true;
        for status in statuses {
            match status {
                HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
                HealthStatus::Healthy | HealthStatus::Degraded => {}
                HealthStatus::Unknown => all_ok = false,
            }
        }

        if all_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Latest recorded result of one named check.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Aggregated view returned to probes.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = HealthStatus::aggregate(components.values().map(|c| c.status));
        Self {
            status,
            components,
            timestamp: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}
