//! Builder pattern for easy registry construction

use crate::checks::{HealthCheck, PostgresHealthCheck};
use crate::registry::HealthRegistry;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Builder for HealthRegistry with common dependency checks
///
/// # Example
///
/// ```rust,no_run
/// use health_registry::HealthRegistryBuilder;
/// use sqlx::PgPool;
///
/// # async fn example(pool: PgPool) {
/// let registry = HealthRegistryBuilder::new()
///     .with_postgres(pool)
///     .build()
///     .await;
/// # }
/// ```
pub struct HealthRegistryBuilder {
    postgres: Option<PgPool>,
    checks: Vec<Arc<dyn HealthCheck>>,
    check_timeout: Duration,
}

impl HealthRegistryBuilder {
    pub fn new() -> Self {
        Self {
            postgres: None,
            checks: Vec::new(),
            check_timeout: Duration::from_secs(5),
        }
    }

    /// Add PostgreSQL health check
    pub fn with_postgres(mut self, pool: PgPool) -> Self {
        self.postgres = Some(pool);
        self
    }

    /// Add a custom check
    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Per-check time limit
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Build the HealthRegistry with all configured checks
    pub async fn build(self) -> HealthRegistry {
        let registry = HealthRegistry::new(self.check_timeout);

        if let Some(pool) = self.postgres {
            registry
                .register(Arc::new(PostgresHealthCheck::new(pool)))
                .await;
        }

        for check in self.checks {
            registry.register(check).await;
        }

        registry
    }
}

impl Default for HealthRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
