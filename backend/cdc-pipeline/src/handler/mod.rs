//! Batch delivery to the destination

mod jsonl;

pub use jsonl::JsonLinesSink;

use crate::models::BufferedEvent;
use async_trait::async_trait;
use resilience::ErrorClass;
use thiserror::Error;

/// A delivery failure with its retry classification
#[derive(Debug, Clone, Error)]
#[error("{class} handler error: {message}")]
pub struct HandlerError {
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Schema, message)
    }
}

/// Delivers a batch of buffered events. Must tolerate re-delivery.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &[BufferedEvent]) -> Result<(), HandlerError>;
}
