//! # Health Registry
//!
//! Aggregates named self-checks into liveness and readiness answers for
//! Kubernetes probes.
//!
//! ## Features
//!
//! - Named checks registered at runtime
//! - Per-check timeout so one hanging dependency cannot block the others
//! - Latest result recorded per check name
//! - Overall status aggregation (Healthy / Degraded / Unhealthy / Unknown)
//! - Background re-checking on an interval
//!
//! ## Example
//!
//! ```ignore
//! use health_registry::HealthRegistryBuilder;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(pool: sqlx::PgPool) {
//! let registry = Arc::new(
//!     HealthRegistryBuilder::new()
//!         .with_postgres(pool)
//!         .with_check_timeout(Duration::from_secs(2))
//!         .build()
//!         .await,
//! );
//!
//! let report = registry.check_all().await;
//! println!("overall: {}", report.status);
//! # }
//! ```

mod builder;
mod checks;
mod error;
mod health;
mod registry;

pub use builder::HealthRegistryBuilder;
pub use checks::{CheckOutcome, HealthCheck, PostgresHealthCheck};
pub use error::{HealthCheckError, Result};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use registry::HealthRegistry;
