//! Error types for health check operations

use std::time::Duration;
use thiserror::Error;

/// Result type for health check operations
pub type Result<T> = std::result::Result<T, HealthCheckError>;

/// Errors a check can report; every variant maps to an Unhealthy component
#[derive(Debug, Error)]
pub enum HealthCheckError {
    /// Database connection or query failure
    #[error("Database health check failed: {0}")]
    Database(String),

    /// A storage component (buffer, checkpoint, dead letters) could not be read
    #[error("Store health check failed: {0}")]
    Store(String),

    /// The check did not answer within the registry's per-check timeout
    #[error("Health check timed out after {0:?}")]
    Timeout(Duration),

    /// Generic health check failure
    #[error("Health check failed: {0}")]
    Generic(String),
}

impl HealthCheckError {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}
