//! Pipeline self-checks for the health registry

use crate::buffer::EventBuffer;
use crate::coordinator::PipelineHandle;
use crate::dlq::DeadLetterStore;
use crate::state::PipelineState;
use async_trait::async_trait;
use health_registry::{CheckOutcome, HealthCheck, HealthCheckError};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state as a health answer.
pub struct PipelineStateCheck {
    handle: PipelineHandle,
}

impl PipelineStateCheck {
    pub fn new(handle: PipelineHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl HealthCheck for PipelineStateCheck {
    fn name(&self) -> &str {
        "pipeline"
    }

    async fn check(&self) -> health_registry::Result<CheckOutcome> {
        Ok(match self.handle.state() {
            PipelineState::Running => CheckOutcome::healthy(),
            PipelineState::Paused => CheckOutcome::degraded("ingestion paused"),
            PipelineState::Starting => CheckOutcome::unknown("starting"),
            state @ (PipelineState::Stopping | PipelineState::Stopped) => {
                CheckOutcome::unhealthy(format!("pipeline {}", state))
            }
            PipelineState::Failed => CheckOutcome::unhealthy("pipeline failed"),
        })
    }
}

/// Degraded once the oldest unprocessed entry is older than `max_lag`.
pub struct BufferLagCheck {
    source_id: String,
    buffer: Arc<dyn EventBuffer>,
    max_lag: Duration,
}

impl BufferLagCheck {
    pub fn new(source_id: impl Into<String>, buffer: Arc<dyn EventBuffer>, max_lag: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            buffer,
            max_lag,
        }
    }
}

#[async_trait]
impl HealthCheck for BufferLagCheck {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn check(&self) -> health_registry::Result<CheckOutcome> {
        let stats = self
            .buffer
            .stats(&self.source_id)
            .await
            .map_err(|e| HealthCheckError::store(format!("buffer stats unavailable: {}", e)))?;

        match stats.oldest_unprocessed_age {
            Some(age) if age > self.max_lag => Ok(CheckOutcome::degraded(format!(
                "{} pending, oldest {}s old",
                stats.depth,
                age.as_secs()
            ))),
            _ => Ok(CheckOutcome::healthy()),
        }
    }
}

/// Degraded once dead letters pile up past `warn_threshold`.
pub struct DeadLetterCheck {
    dead_letters: Arc<dyn DeadLetterStore>,
    warn_threshold: u64,
}

impl DeadLetterCheck {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>, warn_threshold: u64) -> Self {
        Self {
            dead_letters,
            warn_threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for DeadLetterCheck {
    fn name(&self) -> &str {
        "dead_letters"
    }

    async fn check(&self) -> health_registry::Result<CheckOutcome> {
        let stats = self
            .dead_letters
            .stats()
            .await
            .map_err(|e| HealthCheckError::store(format!("dead letter stats unavailable: {}", e)))?;

        if stats.total > self.warn_threshold {
            Ok(CheckOutcome::degraded(format!(
                "{} dead letters (threshold {})",
                stats.total, self.warn_threshold
            )))
        } else {
            Ok(CheckOutcome::healthy())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryEventBuffer;
    use crate::dlq::MemoryDeadLetterStore;
    use crate::models::tests::sample_event;
    use crate::models::FailedEvent;
    use health_registry::HealthStatus;
    use resilience::ErrorClass;

    #[tokio::test]
    async fn test_buffer_lag_check() {
        let buffer = Arc::new(MemoryEventBuffer::new(Arc::new(MemoryDeadLetterStore::new())));
        buffer.write(&[sample_event("a", 1)]).await.unwrap();

        let relaxed = BufferLagCheck::new("a", buffer.clone(), Duration::from_secs(300));
        assert_eq!(relaxed.check().await.unwrap().status, HealthStatus::Healthy);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let strict = BufferLagCheck::new("a", buffer, Duration::from_millis(1));
        assert_eq!(strict.check().await.unwrap().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_dead_letter_check_threshold() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let check = DeadLetterCheck::new(store.clone(), 1);
        assert_eq!(check.check().await.unwrap().status, HealthStatus::Healthy);

        for n in 1..=2 {
            let entry = FailedEvent::new(sample_event("a", n), "boom", ErrorClass::Permanent, None);
            store.write(&entry).await.unwrap();
        }
        let outcome = check.check().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Degraded);
        assert!(outcome.message.unwrap().contains("2 dead letters"));
    }
}
