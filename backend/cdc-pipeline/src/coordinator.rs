//! Pipeline orchestration
//!
//! The coordinator restores the source's checkpoint, starts the source, and
//! writes every event to the buffer before treating it as accepted. The
//! checkpoint only ever covers accepted events, so a crash at any point
//! replays from the last saved position and nothing is lost; duplicates are
//! possible and expected.

use crate::backpressure::{BackpressureController, BackpressureThresholds};
use crate::batch_processor::{BatchProcessor, BatchSettings};
use crate::buffer::EventBuffer;
use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::dlq::DeadLetterStore;
use crate::error::{PipelineError, PipelineResult, StoreError, StoreResult};
use crate::handler::BatchHandler;
use crate::metrics::PipelineMetrics;
use crate::models::{compare_positions, Checkpoint, Event};
use crate::source::{Source, SourceStreams};
use crate::state::{PipelineState, StateMachine};
use resilience::{
    join_within, wait_for_shutdown, with_timeout, ErrorClass, RetryError, RetryExecutor,
    RetryPolicy,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub checkpoint_enabled: bool,
    pub checkpoint_interval: Duration,
    pub shutdown_grace_period: Duration,
    pub ingest_batch_size: usize,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
    /// `None` disables backpressure
    pub backpressure: Option<BackpressureThresholds>,
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        let backpressure = if config.backpressure.enabled {
            Some(config.backpressure_thresholds()?)
        } else {
            None
        };

        Ok(Self {
            checkpoint_enabled: config.checkpoint.enabled,
            checkpoint_interval: config.checkpoint_interval(),
            shutdown_grace_period: config.shutdown_grace_period(),
            ingest_batch_size: config.service.ingest_batch_size,
            retry: config.retry_policy(),
            batch: BatchSettings {
                batch_size: config.batch.size,
                flush_interval: config.flush_interval(),
                handler_timeout: config.handler_timeout(),
                cleanup_interval: config.cleanup_interval(),
                buffer_retention: config.buffer_retention(),
                dead_letter_enabled: config.dlq.enabled,
                dead_letter_retention: config.dlq_retention(),
            },
            backpressure,
        })
    }
}

/// Pluggable parts of a pipeline
#[derive(Clone)]
pub struct PipelineComponents {
    pub source: Arc<dyn Source>,
    pub handler: Arc<dyn BatchHandler>,
    pub buffer: Arc<dyn EventBuffer>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

/// Cloneable control surface for a running pipeline.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    state: Arc<StateMachine>,
}

impl PipelineHandle {
    pub(crate) fn new(state: Arc<StateMachine>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Stop reading from the source. `Ok(false)` if already paused.
    pub fn pause(&self) -> PipelineResult<bool> {
        self.state.pause()
    }

    /// Continue reading from the source. `Ok(false)` if already running.
    pub fn resume(&self) -> PipelineResult<bool> {
        self.state.resume()
    }
}

#[derive(Default)]
struct Progress {
    /// Position and transaction of the last accepted event
    current: Option<(String, Option<String>)>,
    saved: Option<String>,
}

/// Accepted position and its persistence
struct PositionTracker {
    source_id: String,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: Mutex<Progress>,
    metrics: PipelineMetrics,
}

impl PositionTracker {
    async fn restore(&self, checkpoint: &Checkpoint) {
        let mut progress = self.progress.lock().await;
        progress.current = Some((checkpoint.position.clone(), checkpoint.transaction_id.clone()));
        progress.saved = Some(checkpoint.position.clone());
    }

    async fn advance(&self, position: String, transaction_id: Option<String>) {
        self.progress.lock().await.current = Some((position, transaction_id));
    }

    async fn current_position(&self) -> Option<String> {
        self.progress
            .lock()
            .await
            .current
            .as_ref()
            .map(|(p, _)| p.clone())
    }

    /// Persist the accepted position. Unless `force`, skips when nothing
    /// changed since the last save. Returns whether a save happened.
    async fn save(&self, force: bool) -> StoreResult<bool> {
        let mut progress = self.progress.lock().await;
        let Some((position, transaction_id)) = progress.current.clone() else {
            return Ok(false);
        };
        if !force && progress.saved.as_deref() == Some(position.as_str()) {
            return Ok(false);
        }

        if let Some(previous) = &progress.saved {
            if compare_positions(&position, previous) == Ordering::Less {
                warn!(
                    source_id = %self.source_id,
                    previous = %previous,
                    position = %position,
                    "Checkpoint moving backwards"
                );
            }
        }

        let checkpoint = Checkpoint {
            source_id: self.source_id.clone(),
            position: position.clone(),
            transaction_id,
            committed_at: chrono::Utc::now(),
            metadata: BTreeMap::from([(
                "writer".to_string(),
                env!("CARGO_PKG_NAME").to_string(),
            )]),
        };
        self.checkpoints.save(&checkpoint).await?;

        progress.saved = Some(position);
        self.metrics.checkpoint_saves.inc();
        Ok(true)
    }

    async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {
                    match self.save(false).await {
                        Ok(true) => debug!(source_id = %self.source_id, "Periodic checkpoint saved"),
                        Ok(false) => {}
                        Err(e) => warn!(source_id = %self.source_id, error = %e, "Periodic checkpoint save failed"),
                    }
                }
            }
        }
        debug!(source_id = %self.source_id, "Checkpoint saver stopped");
    }
}

enum IngestExit {
    Shutdown,
    SourceClosed,
    Failed(PipelineError),
}

fn classify_store_error(e: &StoreError) -> ErrorClass {
    if e.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

pub struct PipelineCoordinator {
    settings: PipelineSettings,
    components: PipelineComponents,
    state: Arc<StateMachine>,
    tracker: Arc<PositionTracker>,
    retry: RetryExecutor,
    metrics: PipelineMetrics,
}

impl PipelineCoordinator {
    pub fn new(
        settings: PipelineSettings,
        components: PipelineComponents,
        metrics: PipelineMetrics,
    ) -> Self {
        let tracker = Arc::new(PositionTracker {
            source_id: components.source.name().to_string(),
            checkpoints: components.checkpoints.clone(),
            progress: Mutex::new(Progress::default()),
            metrics: metrics.clone(),
        });

        Self {
            retry: RetryExecutor::new(settings.retry.clone()),
            settings,
            components,
            state: Arc::new(StateMachine::new()),
            tracker,
            metrics,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle::new(self.state.clone())
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn source_id(&self) -> &str {
        self.components.source.name()
    }

    /// Position of the last event accepted into the buffer
    pub async fn accepted_position(&self) -> Option<String> {
        self.tracker.current_position().await
    }

    fn set_state(&self, next: PipelineState) -> PipelineResult<()> {
        self.state.transition(next)?;
        self.metrics.state.set(next.code());
        Ok(())
    }

    fn fail(&self) {
        self.state.fail();
        self.metrics.state.set(self.state.current().code());
    }

    /// Run until `shutdown` fires, the source closes, or a fatal error.
    ///
    /// Returns `Ok(())` after a clean stop. Every exit path attempts a final
    /// checkpoint save.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
        let source_id = self.source_id().to_string();
        self.metrics.state.set(self.state.current().code());

        let resume_from = if self.settings.checkpoint_enabled {
            match self.components.checkpoints.load(&source_id).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(source_id = %source_id, error = %e, "Failed to restore checkpoint");
                    self.fail();
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        match &resume_from {
            Some(checkpoint) => {
                info!(
                    source_id = %source_id,
                    position = %checkpoint.position,
                    committed_at = %checkpoint.committed_at,
                    "Resuming from checkpoint"
                );
                self.tracker.restore(checkpoint).await;
            }
            None => info!(source_id = %source_id, "No checkpoint found; starting fresh"),
        }

        let streams = match self.components.source.start(resume_from).await {
            Ok(streams) => streams,
            Err(e) => {
                error!(source_id = %source_id, error = %e, "Failed to start source");
                self.fail();
                return Err(e.into());
            }
        };

        if let Err(e) = self.set_state(PipelineState::Running) {
            let _ = self.components.source.stop().await;
            self.fail();
            return Err(e);
        }

        let (tasks_tx, tasks_rx) = watch::channel(false);
        let tasks = self.spawn_background(tasks_rx);

        let exit = self.ingest(streams, &mut shutdown).await;

        let failure = match exit {
            IngestExit::Shutdown => {
                info!(source_id = %source_id, "Shutdown requested");
                None
            }
            IngestExit::SourceClosed => {
                info!(source_id = %source_id, "Source closed its event stream");
                None
            }
            IngestExit::Failed(e) => Some(e),
        };

        if failure.is_some() {
            self.fail();
        } else if let Err(e) = self.set_state(PipelineState::Stopping) {
            warn!(error = %e, "Could not enter Stopping");
        }

        let clean = self.drain(tasks_tx, tasks).await;

        if self.settings.checkpoint_enabled {
            self.final_checkpoint().await;
        }

        match (failure, clean) {
            (Some(e), _) => {
                error!(source_id = %source_id, error = %e, "Pipeline failed");
                self.fail();
                Err(e)
            }
            (None, false) => {
                let grace = self.settings.shutdown_grace_period;
                error!(source_id = %source_id, grace = ?grace, "Shutdown exceeded grace period");
                self.fail();
                Err(PipelineError::ShutdownTimeout(grace))
            }
            (None, true) => {
                self.set_state(PipelineState::Stopped)?;
                info!(source_id = %source_id, "Pipeline stopped");
                Ok(())
            }
        }
    }

    fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<(&'static str, JoinHandle<()>)> {
        let source_id = self.source_id().to_string();
        let mut tasks = Vec::new();

        let processor = Arc::new(BatchProcessor::new(
            source_id.clone(),
            self.components.buffer.clone(),
            self.components.dead_letters.clone(),
            self.components.handler.clone(),
            self.retry.clone(),
            self.settings.batch.clone(),
            self.metrics.clone(),
        ));
        tasks.push((
            "flush",
            tokio::spawn(processor.clone().run_flush_loop(shutdown.clone())),
        ));
        tasks.push((
            "cleanup",
            tokio::spawn(processor.run_cleanup_loop(shutdown.clone())),
        ));

        if self.settings.checkpoint_enabled {
            tasks.push((
                "checkpoint",
                tokio::spawn(
                    self.tracker
                        .clone()
                        .run(self.settings.checkpoint_interval, shutdown.clone()),
                ),
            ));
        }

        if let Some(thresholds) = self.settings.backpressure {
            let controller = Arc::new(BackpressureController::new(
                thresholds,
                source_id,
                self.components.buffer.clone(),
                self.handle(),
                self.metrics.clone(),
            ));
            tasks.push(("backpressure", tokio::spawn(controller.run(shutdown))));
        }

        tasks
    }

    async fn ingest(&self, mut streams: SourceStreams, shutdown: &mut watch::Receiver<bool>) -> IngestExit {
        let mut state_rx = self.state.subscribe();
        let mut errors_open = true;
        let mut pending: Vec<Event> = Vec::with_capacity(self.settings.ingest_batch_size);

        loop {
            let state = *state_rx.borrow_and_update();
            self.metrics.state.set(state.code());
            let paused = state == PipelineState::Paused;

            tokio::select! {
                biased;

                _ = wait_for_shutdown(shutdown) => return IngestExit::Shutdown,

                error = streams.errors.recv(), if errors_open => match error {
                    Some(e) => {
                        error!(source_id = %self.source_id(), error = %e, "Source reported a fatal error");
                        return IngestExit::Failed(e.into());
                    }
                    None => errors_open = false,
                },

                // wake up to re-evaluate pause/resume
                _ = state_rx.changed() => {}

                event = streams.events.recv(), if !paused => match event {
                    Some(event) => {
                        pending.push(event);
                        while pending.len() < self.settings.ingest_batch_size {
                            match streams.events.try_recv() {
                                Ok(event) => pending.push(event),
                                Err(_) => break,
                            }
                        }
                        if let Err(exit) = self.accept(&mut pending, shutdown).await {
                            return exit;
                        }
                    }
                    None => return IngestExit::SourceClosed,
                },
            }
        }
    }

    /// Write pending events to the buffer and advance the accepted position.
    ///
    /// Once shutdown is signalled an in-flight write gets the grace period to
    /// finish; after that the events stay unaccepted and the pipeline fails.
    async fn accept(&self, pending: &mut Vec<Event>, shutdown: &mut watch::Receiver<bool>) -> Result<(), IngestExit> {
        let grace = self.settings.shutdown_grace_period;
        let mut signal = shutdown.clone();
        let batch: &[Event] = pending;
        let buffer = &self.components.buffer;

        let write = self
            .retry
            .execute(move || buffer.write(batch), classify_store_error, shutdown);

        let result = tokio::select! {
            result = write => result,
            _ = async {
                wait_for_shutdown(&mut signal).await;
                tokio::time::sleep(grace).await;
            } => {
                error!(
                    source_id = %self.source_id(),
                    grace = ?grace,
                    count = batch.len(),
                    "Buffer write still in flight after grace period"
                );
                return Err(IngestExit::Failed(PipelineError::ShutdownTimeout(grace)));
            }
        };

        match result {
            Ok(ids) => {
                if let Some(last) = pending.last() {
                    self.tracker
                        .advance(last.position.clone(), last.transaction_id.clone())
                        .await;
                }
                self.metrics.events_buffered.inc_by(ids.len() as u64);
                pending.clear();
                Ok(())
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                info!(
                    source_id = %self.source_id(),
                    attempts,
                    count = pending.len(),
                    "Shutdown during buffer write; events not accepted"
                );
                Err(IngestExit::Shutdown)
            }
            Err(e) => {
                let attempts = e.attempts();
                let message = e
                    .last_error()
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                error!(
                    source_id = %self.source_id(),
                    attempts,
                    error = %message,
                    "Buffer write failed"
                );
                Err(IngestExit::Failed(PipelineError::BufferWrite { attempts, message }))
            }
        }
    }

    /// Stop the source and wait for background tasks. Returns false if the
    /// grace period ran out.
    async fn drain(&self, tasks_tx: watch::Sender<bool>, tasks: Vec<(&'static str, JoinHandle<()>)>) -> bool {
        let grace = self.settings.shutdown_grace_period;
        let started = Instant::now();
        let _ = tasks_tx.send(true);

        let mut clean = true;
        match with_timeout(grace, self.components.source.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(source_id = %self.source_id(), error = %e, "Source stop reported an error"),
            Err(_) => {
                warn!(source_id = %self.source_id(), "Source did not stop within grace period");
                clean = false;
            }
        }

        let remaining = grace.saturating_sub(started.elapsed());
        if join_within(remaining, tasks).await.is_err() {
            warn!(source_id = %self.source_id(), "Background tasks aborted after grace period");
            clean = false;
        }
        clean
    }

    async fn final_checkpoint(&self) {
        let position = self.tracker.current_position().await;
        match with_timeout(self.settings.shutdown_grace_period, self.tracker.save(true)).await {
            Ok(Ok(true)) => info!(
                source_id = %self.source_id(),
                position = ?position,
                "Final checkpoint saved"
            ),
            Ok(Ok(false)) => debug!(source_id = %self.source_id(), "No accepted position to checkpoint"),
            Ok(Err(e)) => error!(source_id = %self.source_id(), error = %e, "Final checkpoint save failed"),
            Err(e) => error!(source_id = %self.source_id(), error = %e, "Final checkpoint save timed out"),
        }
    }
}
