//! Buffer-depth driven pause and resume of ingestion

use crate::buffer::EventBuffer;
use crate::coordinator::PipelineHandle;
use crate::error::{PipelineError, PipelineResult, StoreResult};
use crate::metrics::PipelineMetrics;
use crate::state::PipelineState;
use resilience::wait_for_shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause at `high`, resume at `low`. Always `low < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureThresholds {
    high: u64,
    low: u64,
    check_interval: Duration,
}

impl BackpressureThresholds {
    pub fn new(high: u64, low: u64, check_interval: Duration) -> PipelineResult<Self> {
        if low >= high {
            return Err(PipelineError::Config(format!(
                "backpressure low watermark ({}) must be below high watermark ({})",
                low, high
            )));
        }
        Ok(Self {
            high,
            low,
            check_interval,
        })
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    Pause,
    Resume,
    Hold,
}

/// Decide what to do given the current depth and whether the controller's
/// pause is in effect. Between the watermarks the current state is kept.
pub fn decide(thresholds: &BackpressureThresholds, depth: u64, paused: bool) -> BackpressureAction {
    if depth >= thresholds.high {
        if paused {
            BackpressureAction::Hold
        } else {
            BackpressureAction::Pause
        }
    } else if paused && depth <= thresholds.low {
        BackpressureAction::Resume
    } else {
        BackpressureAction::Hold
    }
}

/// Polls buffer depth and pauses/resumes through a [`PipelineHandle`].
///
/// Only a pause this controller issued is ever lifted by it; an operator's
/// manual pause stays in place.
pub struct BackpressureController {
    thresholds: BackpressureThresholds,
    source_id: String,
    buffer: Arc<dyn EventBuffer>,
    handle: PipelineHandle,
    metrics: PipelineMetrics,
    paused_by_us: AtomicBool,
}

impl BackpressureController {
    pub fn new(
        thresholds: BackpressureThresholds,
        source_id: impl Into<String>,
        buffer: Arc<dyn EventBuffer>,
        handle: PipelineHandle,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            thresholds,
            source_id: source_id.into(),
            buffer,
            handle,
            metrics,
            paused_by_us: AtomicBool::new(false),
        }
    }

    pub fn is_paused_by_backpressure(&self) -> bool {
        self.paused_by_us.load(Ordering::SeqCst)
    }

    /// One poll: read depth, decide, act.
    pub async fn check_once(&self) -> StoreResult<BackpressureAction> {
        let stats = self.buffer.stats(&self.source_id).await?;
        self.metrics.buffer_depth.set(stats.depth as i64);
        self.metrics.oldest_unprocessed_age_seconds.set(
            stats
                .oldest_unprocessed_age
                .map(|a| a.as_secs() as i64)
                .unwrap_or(0),
        );

        // an operator resume (or any other exit from Paused) ends our pause
        if self.is_paused_by_backpressure() && self.handle.state() != PipelineState::Paused {
            self.paused_by_us.store(false, Ordering::SeqCst);
            self.metrics.paused.set(0);
            debug!(source_id = %self.source_id, "Backpressure pause lifted externally");
        }

        let action = decide(&self.thresholds, stats.depth, self.is_paused_by_backpressure());
        match action {
            BackpressureAction::Pause => match self.handle.pause() {
                Ok(true) => {
                    self.paused_by_us.store(true, Ordering::SeqCst);
                    self.metrics.paused.set(1);
                    warn!(
                        source_id = %self.source_id,
                        depth = stats.depth,
                        high_watermark = self.thresholds.high,
                        "Buffer above high watermark; ingestion paused"
                    );
                }
                // already paused by someone else; not ours to lift
                Ok(false) => {}
                Err(e) => debug!(error = %e, "Backpressure pause not applied"),
            },
            BackpressureAction::Resume => {
                match self.handle.resume() {
                    Ok(_) => info!(
                        source_id = %self.source_id,
                        depth = stats.depth,
                        low_watermark = self.thresholds.low,
                        "Buffer drained below low watermark; ingestion resumed"
                    ),
                    Err(e) => debug!(error = %e, "Backpressure resume not applied"),
                }
                self.paused_by_us.store(false, Ordering::SeqCst);
                self.metrics.paused.set(0);
            }
            BackpressureAction::Hold => {}
        }

        Ok(action)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.thresholds.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        warn!(source_id = %self.source_id, error = %e, "Backpressure check failed");
                    }
                }
            }
        }
        debug!(source_id = %self.source_id, "Backpressure controller stopped");
    }
}
