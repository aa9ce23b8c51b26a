//! Drains the buffer into the batch handler
//!
//! Two independent loops: a flush loop that reads unprocessed batches and
//! delivers them under the retry policy, and a cleanup loop that prunes
//! processed buffer rows and expired dead letters.

use crate::buffer::EventBuffer;
use crate::dlq::DeadLetterStore;
use crate::error::StoreResult;
use crate::handler::{BatchHandler, HandlerError};
use crate::metrics::PipelineMetrics;
use crate::models::{BufferedEvent, FailedEvent};
use resilience::{wait_for_shutdown, with_timeout, ErrorClass, RetryError, RetryExecutor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub handler_timeout: Duration,
    pub cleanup_interval: Duration,
    pub buffer_retention: Duration,
    /// When false, undeliverable batches stay pending in the buffer.
    pub dead_letter_enabled: bool,
    pub dead_letter_retention: Option<Duration>,
}

/// Result of one flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Idle,
    Delivered(usize),
    DeadLettered(usize),
    /// Left pending: delivery was cancelled by shutdown or dead-lettering is off
    Deferred(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub buffer_removed: u64,
    pub dead_letters_expired: u64,
}

pub struct BatchProcessor {
    source_id: String,
    buffer: Arc<dyn EventBuffer>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handler: Arc<dyn BatchHandler>,
    retry: RetryExecutor,
    settings: BatchSettings,
    metrics: PipelineMetrics,
}

impl BatchProcessor {
    pub fn new(
        source_id: impl Into<String>,
        buffer: Arc<dyn EventBuffer>,
        dead_letters: Arc<dyn DeadLetterStore>,
        handler: Arc<dyn BatchHandler>,
        retry: RetryExecutor,
        settings: BatchSettings,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            buffer,
            dead_letters,
            handler,
            retry,
            settings,
            metrics,
        }
    }

    async fn deliver(&self, batch: &[BufferedEvent]) -> Result<(), HandlerError> {
        match with_timeout(self.settings.handler_timeout, self.handler.handle(batch)).await {
            Ok(result) => result,
            Err(e) => Err(HandlerError::transient(e.to_string())),
        }
    }

    /// Read one batch and try to deliver it.
    pub async fn flush_once(&self, shutdown: &mut watch::Receiver<bool>) -> StoreResult<FlushOutcome> {
        let batch = self
            .buffer
            .read_batch(&self.source_id, self.settings.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(FlushOutcome::Idle);
        }

        let first = batch[0].sequence_id;
        let last = batch[batch.len() - 1].sequence_id;
        let batch_ref = &batch;

        let result = self
            .retry
            .execute(move || self.deliver(batch_ref), |e: &HandlerError| e.class, shutdown)
            .await;

        match result {
            Ok(()) => {
                let ids: Vec<i64> = batch.iter().map(|e| e.sequence_id).collect();
                self.buffer.mark_processed(&ids).await?;
                self.metrics.batches_delivered.inc();
                self.metrics.events_delivered.inc_by(batch.len() as u64);
                debug!(
                    source_id = %self.source_id,
                    count = batch.len(),
                    first_sequence = first,
                    last_sequence = last,
                    "Batch delivered"
                );
                Ok(FlushOutcome::Delivered(batch.len()))
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                info!(
                    source_id = %self.source_id,
                    attempts,
                    count = batch.len(),
                    "Delivery interrupted by shutdown; batch left pending"
                );
                Ok(FlushOutcome::Deferred(batch.len()))
            }
            Err(RetryError::Permanent {
                attempts,
                class,
                last_error,
            }) => self.give_up(&batch, attempts, class, last_error.message).await,
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                self.give_up(&batch, attempts, last_error.class, last_error.message)
                    .await
            }
        }
    }

    /// Dead-letter a batch whose delivery will not be retried again.
    async fn give_up(
        &self,
        batch: &[BufferedEvent],
        attempts: u32,
        class: ErrorClass,
        message: String,
    ) -> StoreResult<FlushOutcome> {
        self.metrics.delivery_failures.inc();
        let first = batch.first().map(|e| e.sequence_id);
        let last = batch.last().map(|e| e.sequence_id);

        if !self.settings.dead_letter_enabled {
            error!(
                source_id = %self.source_id,
                attempts,
                error_class = %class,
                error = %message,
                first_sequence = ?first,
                last_sequence = ?last,
                "Batch delivery failed and dead-lettering is disabled; batch left pending"
            );
            return Ok(FlushOutcome::Deferred(batch.len()));
        }

        let entries: Vec<FailedEvent> = batch
            .iter()
            .map(|e| {
                FailedEvent::from_buffered(
                    e,
                    message.clone(),
                    class,
                    self.settings.dead_letter_retention,
                )
            })
            .collect();
        self.buffer.dead_letter(&entries).await?;
        self.metrics.events_dead_lettered.inc_by(entries.len() as u64);

        warn!(
            source_id = %self.source_id,
            attempts,
            error_class = %class,
            error = %message,
            count = entries.len(),
            "Batch moved to dead letter store"
        );
        Ok(FlushOutcome::DeadLettered(entries.len()))
    }

    /// Prune processed buffer rows past retention and expired dead letters.
    pub async fn cleanup_once(&self) -> StoreResult<CleanupOutcome> {
        let buffer_removed = self.buffer.cleanup(self.settings.buffer_retention).await?;
        let dead_letters_expired = self.dead_letters.cleanup().await?;
        Ok(CleanupOutcome {
            buffer_removed,
            dead_letters_expired,
        })
    }

    /// Flush on every tick; keep flushing while full batches come back.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(source_id = %self.source_id, batch_size = self.settings.batch_size, "Flush loop started");

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            loop {
                match self.flush_once(&mut shutdown).await {
                    Ok(FlushOutcome::Delivered(n)) | Ok(FlushOutcome::DeadLettered(n))
                        if n >= self.settings.batch_size && !*shutdown.borrow() => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!(source_id = %self.source_id, error = %e, "Flush failed; retrying next tick");
                        break;
                    }
                }
            }
        }
        info!(source_id = %self.source_id, "Flush loop stopped");
    }

    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {
                    match self.cleanup_once().await {
                        Ok(outcome) => debug!(
                            source_id = %self.source_id,
                            buffer_removed = outcome.buffer_removed,
                            dead_letters_expired = outcome.dead_letters_expired,
                            "Cleanup pass finished"
                        ),
                        Err(e) => warn!(source_id = %self.source_id, error = %e, "Cleanup pass failed"),
                    }
                }
            }
        }
        debug!(source_id = %self.source_id, "Cleanup loop stopped");
    }
}
