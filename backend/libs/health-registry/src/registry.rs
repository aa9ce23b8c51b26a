//! Health registry and background monitoring

use crate::checks::{CheckOutcome, HealthCheck};
use crate::error::HealthCheckError;
use crate::health::{ComponentHealth, HealthReport, HealthStatus};
use chrono::Utc;
use futures::future::join_all;
use resilience::{wait_for_shutdown, with_timeout};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// Coordinates named health checks and remembers the latest result of each.
pub struct HealthRegistry {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    results: RwLock<HashMap<String, ComponentHealth>>,
    check_timeout: Duration,
}

impl HealthRegistry {
    /// Create an empty registry
    ///
    /// `check_timeout` bounds every individual check.
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            results: RwLock::new(HashMap::new()),
            check_timeout,
        }
    }

    /// Register a health check
    ///
    /// A check registered under an existing name replaces the previous one.
    pub async fn register(&self, check: Arc<dyn HealthCheck>) {
        let mut checks = self.checks.write().await;
        checks.retain(|c| c.name() != check.name());
        debug!(check = check.name(), "Registered health check");
        checks.push(check);
    }

    /// Names of all registered checks
    pub async fn names(&self) -> Vec<String> {
        self.checks
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Run every registered check concurrently and record the results.
    pub async fn check_all(&self) -> HealthReport {
        let checks: Vec<Arc<dyn HealthCheck>> = self.checks.read().await.clone();
        let timeout = self.check_timeout;

        let results = join_all(checks.into_iter().map(|check| async move {
            let started = Instant::now();
            let outcome = match with_timeout(timeout, check.check()).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => CheckOutcome::unhealthy(e.to_string()),
                Err(_) => CheckOutcome::unhealthy(HealthCheckError::Timeout(timeout).to_string()),
            };

            if outcome.status == HealthStatus::Unhealthy {
                warn!(
                    check = check.name(),
                    message = ?outcome.message,
                    "Health check reported unhealthy"
                );
            }

            (
                check.name().to_string(),
                ComponentHealth {
                    status: outcome.status,
                    message: outcome.message,
                    latency_ms: started.elapsed().as_millis() as u64,
                    checked_at: Utc::now(),
                },
            )
        }))
        .await;

        let mut recorded = self.results.write().await;
        for (name, health) in &results {
            recorded.insert(name.clone(), health.clone());
        }
        drop(recorded);

        HealthReport::from_components(results.into_iter().collect())
    }

    /// Report built from the most recent recorded results, without running checks.
    pub async fn latest(&self) -> HealthReport {
        let names = self.names().await;
        let recorded = self.results.read().await;

        let components: BTreeMap<String, ComponentHealth> = names
            .into_iter()
            .map(|name| {
                let health = recorded.get(&name).cloned().unwrap_or(ComponentHealth {
                    status: HealthStatus::Unknown,
                    message: Some("not checked yet".to_string()),
                    latency_ms: 0,
                    checked_at: Utc::now(),
                });
                (name, health)
            })
            .collect();

        HealthReport::from_components(components)
    }

    /// Overall status from the most recent recorded results
    pub async fn overall_status(&self) -> HealthStatus {
        self.latest().await.status
    }

    /// Spawn a task that runs `check_all` every `interval` until shutdown.
    pub fn start_background_check(
        registry: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => {
                        debug!("Background health checks stopping");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        let report = registry.check_all().await;
                        debug!(status = %report.status, "Background health check completed");
                    }
                }
            }
        })
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
