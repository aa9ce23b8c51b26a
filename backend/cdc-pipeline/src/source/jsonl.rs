//! Newline-delimited Debezium change envelopes read from a file
//!
//! The file is followed like `tail -f`: reaching the end waits for more
//! lines instead of closing the stream. An event's position is its 1-based
//! line number, zero padded to 20 digits.

use super::{Source, SourceError, SourceStreams};
use crate::models::{Checkpoint, Event, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resilience::wait_for_shutdown;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Debezium operation codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeOp {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    /// Initial snapshot read
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "t")]
    Truncate,
}

/// A change envelope with or without the schema wrapper
/// (`value.converter.schemas.enable`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeEnvelope {
    WithSchema { payload: ChangePayload },
    WithoutSchema(ChangePayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePayload {
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub source: ChangeSourceInfo,
    pub op: ChangeOp,
    pub ts_ms: i64,
    /// Primary key image, when the producer includes it
    #[serde(default)]
    pub key: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSourceInfo {
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    #[serde(default, rename = "txId")]
    pub tx_id: Option<i64>,
    #[serde(default)]
    pub lsn: Option<i64>,
}

impl ChangeEnvelope {
    pub fn parse(line: &str) -> Result<Self, SourceError> {
        serde_json::from_str(line).map_err(|e| SourceError::Decode(e.to_string()))
    }

    pub fn payload(&self) -> &ChangePayload {
        match self {
            ChangeEnvelope::WithSchema { payload } => payload,
            ChangeEnvelope::WithoutSchema(payload) => payload,
        }
    }

    fn into_payload(self) -> ChangePayload {
        match self {
            ChangeEnvelope::WithSchema { payload } => payload,
            ChangeEnvelope::WithoutSchema(payload) => payload,
        }
    }

    /// Check the row images an operation needs are present.
    pub fn validate(&self) -> Result<(), SourceError> {
        let payload = self.payload();
        let missing = match payload.op {
            ChangeOp::Create | ChangeOp::Read | ChangeOp::Update if payload.after.is_none() => {
                Some("after")
            }
            ChangeOp::Delete if payload.before.is_none() => Some("before"),
            _ => None,
        };

        match missing {
            Some(field) => Err(SourceError::Decode(format!(
                "{:?} on {} requires '{}'",
                payload.op, payload.source.table, field
            ))),
            None => Ok(()),
        }
    }

    pub fn into_event(self, source_id: &str, position: &str) -> Result<Event, SourceError> {
        self.validate()?;
        let payload = self.into_payload();

        let mut metadata = BTreeMap::new();
        if let Some(db) = &payload.source.db {
            metadata.insert("database".to_string(), db.clone());
        }
        if let Some(lsn) = payload.source.lsn {
            metadata.insert("lsn".to_string(), lsn.to_string());
        }

        let operation = match payload.op {
            ChangeOp::Create => Operation::Insert,
            ChangeOp::Read => {
                metadata.insert("snapshot".to_string(), "true".to_string());
                Operation::Insert
            }
            ChangeOp::Update => Operation::Update,
            ChangeOp::Delete => Operation::Delete,
            ChangeOp::Truncate => Operation::Truncate,
        };

        let key_columns = payload
            .key
            .as_ref()
            .map(|k| k.keys().cloned().collect())
            .unwrap_or_default();

        Ok(Event {
            id: Uuid::new_v5(
                &Uuid::NAMESPACE_OID,
                format!("{}:{}", source_id, position).as_bytes(),
            ),
            source_id: source_id.to_string(),
            position: position.to_string(),
            transaction_id: payload.source.tx_id.map(|t| t.to_string()),
            timestamp: DateTime::from_timestamp_millis(payload.ts_ms).unwrap_or_else(Utc::now),
            schema: payload.source.schema.unwrap_or_default(),
            table: payload.source.table,
            operation,
            before: row_image(payload.before, "before")?,
            after: row_image(payload.after, "after")?,
            key_columns,
            metadata,
        })
    }
}

fn row_image(value: Option<Value>, field: &str) -> Result<Option<Map<String, Value>>, SourceError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(SourceError::Decode(format!(
            "'{}' must be an object, got {}",
            field, other
        ))),
    }
}

/// Format a line number as a position string.
pub(crate) fn line_position(line: u64) -> String {
    format!("{:020}", line)
}

pub struct JsonLinesSource {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
    channel_capacity: usize,
    last_position: Arc<StdMutex<Option<String>>>,
    stop_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl JsonLinesSource {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        channel_capacity: usize,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            path: path.into(),
            poll_interval,
            channel_capacity: channel_capacity.max(1),
            last_position: Arc::new(StdMutex::new(None)),
            stop_tx,
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, resume_from: Option<Checkpoint>) -> Result<SourceStreams, SourceError> {
        let mut reader = self.reader.lock().await;
        if reader.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(SourceError::Fatal(format!(
                "source {} is already running",
                self.name
            )));
        }

        let skip_lines = match &resume_from {
            Some(checkpoint) => checkpoint.position.parse::<u64>().map_err(|_| {
                SourceError::Decode(format!(
                    "checkpoint position {:?} is not a line number",
                    checkpoint.position
                ))
            })?,
            None => 0,
        };

        let file = File::open(&self.path).await.map_err(|e| {
            SourceError::Connection(format!("cannot open {}: {}", self.path.display(), e))
        })?;

        let (events_tx, events) = mpsc::channel(self.channel_capacity);
        let (errors_tx, errors) = mpsc::channel(1);
        self.stop_tx.send_replace(false);

        info!(
            source = %self.name,
            path = %self.path.display(),
            skip_lines,
            "Starting JSON lines source"
        );

        let task = LineReader {
            name: self.name.clone(),
            reader: BufReader::new(file),
            skip_lines,
            poll_interval: self.poll_interval,
            events_tx,
            errors_tx,
            stop_rx: self.stop_tx.subscribe(),
            last_position: self.last_position.clone(),
        };
        *reader = Some(tokio::spawn(task.run()));

        Ok(SourceStreams { events, errors })
    }

    async fn stop(&self) -> Result<(), SourceError> {
        self.stop_tx.send_replace(true);
        let handle = self.reader.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| SourceError::Fatal(format!("reader task failed: {}", e)))?;
        }
        debug!(source = %self.name, "JSON lines source stopped");
        Ok(())
    }

    fn last_position(&self) -> Option<String> {
        self.last_position.lock().ok().and_then(|p| p.clone())
    }
}

struct LineReader {
    name: String,
    reader: BufReader<File>,
    skip_lines: u64,
    poll_interval: Duration,
    events_tx: mpsc::Sender<Event>,
    errors_tx: mpsc::Sender<SourceError>,
    stop_rx: watch::Receiver<bool>,
    last_position: Arc<StdMutex<Option<String>>>,
}

impl LineReader {
    async fn run(mut self) {
        let mut line_no: u64 = 0;
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let read = tokio::select! {
                _ = wait_for_shutdown(&mut self.stop_rx) => break,
                read = self.reader.read_until(b'\n', &mut pending) => read,
            };

            match read {
                Err(e) => {
                    let _ = self.errors_tx.send(SourceError::Io(e)).await;
                    break;
                }
                Ok(0) => {
                    // End of file for now; wait for the writer to append.
                    tokio::select! {
                        _ = wait_for_shutdown(&mut self.stop_rx) => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                Ok(_) if pending.last() != Some(&b'\n') => continue,
                Ok(_) => {}
            }

            line_no += 1;
            let raw = std::mem::take(&mut pending);
            if line_no <= self.skip_lines {
                continue;
            }

            // a line that is not UTF-8 still consumes its position
            let text = match String::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        source = %self.name,
                        line = line_no,
                        error = %e,
                        "Skipping undecodable change record"
                    );
                    continue;
                }
            };
            let line = text.trim();
            if line.is_empty() {
                continue;
            }

            let position = line_position(line_no);
            let event = match ChangeEnvelope::parse(line).and_then(|e| e.into_event(&self.name, &position)) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        source = %self.name,
                        line = line_no,
                        error = %e,
                        "Skipping undecodable change record"
                    );
                    continue;
                }
            };

            tokio::select! {
                _ = wait_for_shutdown(&mut self.stop_rx) => break,
                sent = self.events_tx.send(event) => {
                    if sent.is_err() {
                        debug!(source = %self.name, "Event receiver dropped");
                        break;
                    }
                }
            }

            if let Ok(mut last) = self.last_position.lock() {
                *last = Some(position);
            }
        }
    }
}
