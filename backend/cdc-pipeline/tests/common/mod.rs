//! Test doubles for pipeline integration tests
//!
//! Provides a channel-backed source that tests feed by hand and a handler
//! that records deliveries and can be told to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use cdc_pipeline::batch_processor::BatchSettings;
use cdc_pipeline::buffer::{BufferStats, EventBuffer};
use cdc_pipeline::coordinator::{PipelineComponents, PipelineSettings};
use cdc_pipeline::handler::{BatchHandler, HandlerError};
use cdc_pipeline::models::{
    compare_positions, BufferedEvent, Checkpoint, Event, FailedEvent, Operation,
};
use cdc_pipeline::source::{Source, SourceError, SourceStreams};
use cdc_pipeline::stores::Stores;
use cdc_pipeline::StoreResult;
use chrono::Utc;
use resilience::RetryPolicy;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SOURCE_ID: &str = "shop";

pub fn position(n: u64) -> String {
    format!("{:020}", n)
}

pub fn event(n: u64, table: &str) -> Event {
    let mut after = Map::new();
    after.insert("id".to_string(), Value::from(n));
    after.insert("total".to_string(), json!(n * 10));

    Event {
        id: Uuid::new_v4(),
        source_id: SOURCE_ID.to_string(),
        position: position(n),
        transaction_id: Some(format!("tx-{}", n)),
        timestamp: Utc::now(),
        schema: "public".to_string(),
        table: table.to_string(),
        operation: Operation::Insert,
        before: None,
        after: Some(after),
        key_columns: vec!["id".to_string()],
        metadata: BTreeMap::new(),
    }
}

pub fn events(range: std::ops::RangeInclusive<u64>) -> Vec<Event> {
    range.map(|n| event(n, "orders")).collect()
}

#[derive(Default)]
struct Senders {
    events: Option<mpsc::Sender<Event>>,
    errors: Option<mpsc::Sender<SourceError>>,
}

/// Replays a fixed backlog after the checkpoint, then stays open for
/// events pushed by the test.
pub struct ScriptedSource {
    backlog: Vec<Event>,
    senders: Mutex<Senders>,
    resumed_from: Mutex<Option<String>>,
    last_position: Mutex<Option<String>>,
}

impl ScriptedSource {
    pub fn new(backlog: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            backlog,
            senders: Mutex::new(Senders::default()),
            resumed_from: Mutex::new(None),
            last_position: Mutex::new(None),
        })
    }

    pub fn resumed_from(&self) -> Option<String> {
        self.resumed_from.lock().unwrap().clone()
    }

    pub async fn push(&self, event: Event) {
        let sender = self.senders.lock().unwrap().events.clone();
        *self.last_position.lock().unwrap() = Some(event.position.clone());
        sender
            .expect("source started")
            .send(event)
            .await
            .expect("pipeline reading events");
    }

    /// Close the event stream as if the source ran dry.
    pub fn close(&self) {
        self.senders.lock().unwrap().events = None;
    }

    pub async fn fail(&self, message: &str) {
        let sender = self.senders.lock().unwrap().errors.clone();
        sender
            .expect("source started")
            .send(SourceError::Fatal(message.to_string()))
            .await
            .expect("pipeline reading errors");
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn name(&self) -> &str {
        SOURCE_ID
    }

    async fn start(&self, resume_from: Option<Checkpoint>) -> Result<SourceStreams, SourceError> {
        let after = resume_from.map(|c| c.position);
        *self.resumed_from.lock().unwrap() = after.clone();

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        for event in &self.backlog {
            let replay = match &after {
                Some(after) => compare_positions(&event.position, after) == Ordering::Greater,
                None => true,
            };
            if replay {
                *self.last_position.lock().unwrap() = Some(event.position.clone());
                events_tx
                    .send(event.clone())
                    .await
                    .map_err(|e| SourceError::Fatal(e.to_string()))?;
            }
        }

        let mut senders = self.senders.lock().unwrap();
        senders.events = Some(events_tx);
        senders.errors = Some(errors_tx);

        Ok(SourceStreams {
            events: events_rx,
            errors: errors_rx,
        })
    }

    async fn stop(&self) -> Result<(), SourceError> {
        let mut senders = self.senders.lock().unwrap();
        senders.events = None;
        senders.errors = None;
        Ok(())
    }

    fn last_position(&self) -> Option<String> {
        self.last_position.lock().unwrap().clone()
    }
}

/// Records every delivered batch.
///
/// While `offline`, every batch fails transiently. Batches touching a table
/// in `poison_tables` fail permanently.
pub struct RecordingHandler {
    delivered: Mutex<Vec<Event>>,
    batches: Mutex<Vec<usize>>,
    offline: AtomicBool,
    poison_tables: Vec<String>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Self::with_poison(&[])
    }

    pub fn with_poison(tables: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            poison_tables: tables.iter().map(|t| t.to_string()).collect(),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_positions(&self) -> Vec<String> {
        self.delivered().into_iter().map(|e| e.position).collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchHandler for RecordingHandler {
    async fn handle(&self, batch: &[BufferedEvent]) -> Result<(), HandlerError> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(HandlerError::transient("sink unavailable"));
        }
        if let Some(bad) = batch
            .iter()
            .find(|e| self.poison_tables.contains(&e.event.table))
        {
            return Err(HandlerError::permanent(format!(
                "rejected row from {}",
                bad.event.table
            )));
        }

        self.batches.lock().unwrap().push(batch.len());
        self.delivered
            .lock()
            .unwrap()
            .extend(batch.iter().map(|e| e.event.clone()));
        Ok(())
    }
}

/// A buffer whose writes never complete; everything else goes to `inner`.
pub struct HangingBuffer {
    inner: Arc<dyn EventBuffer>,
    writes: AtomicUsize,
}

impl HangingBuffer {
    pub fn new(inner: Arc<dyn EventBuffer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: AtomicUsize::new(0),
        })
    }

    /// Writes started so far
    pub fn writes(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl EventBuffer for HangingBuffer {
    async fn write(&self, _events: &[Event]) -> StoreResult<Vec<i64>> {
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        std::future::pending().await
    }

    async fn read_batch(&self, source_id: &str, limit: usize) -> StoreResult<Vec<BufferedEvent>> {
        self.inner.read_batch(source_id, limit).await
    }

    async fn mark_processed(&self, ids: &[i64]) -> StoreResult<u64> {
        self.inner.mark_processed(ids).await
    }

    async fn cleanup(&self, retention: Duration) -> StoreResult<u64> {
        self.inner.cleanup(retention).await
    }

    async fn stats(&self, source_id: &str) -> StoreResult<BufferStats> {
        self.inner.stats(source_id).await
    }

    async fn dead_letter(&self, entries: &[FailedEvent]) -> StoreResult<()> {
        self.inner.dead_letter(entries).await
    }
}

/// Settings with short timers so tests finish quickly
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        checkpoint_enabled: true,
        checkpoint_interval: Duration::from_millis(20),
        shutdown_grace_period: Duration::from_secs(5),
        ingest_batch_size: 100,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
        },
        batch: BatchSettings {
            batch_size: 100,
            flush_interval: Duration::from_millis(10),
            handler_timeout: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
            buffer_retention: Duration::from_secs(3600),
            dead_letter_enabled: true,
            dead_letter_retention: None,
        },
        backpressure: None,
    }
}

pub fn components(source: Arc<ScriptedSource>, handler: Arc<RecordingHandler>, stores: &Stores) -> PipelineComponents {
    PipelineComponents {
        source,
        handler,
        buffer: stores.buffer.clone(),
        checkpoints: stores.checkpoints.clone(),
        dead_letters: stores.dead_letters.clone(),
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
