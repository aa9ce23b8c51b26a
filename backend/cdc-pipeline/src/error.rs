use crate::state::PipelineState;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Failures of the checkpoint, buffer and dead-letter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Store error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether repeating the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Other(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Buffer write failed after {attempts} attempts: {message}")]
    BufferWrite { attempts: u32, message: String },

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
