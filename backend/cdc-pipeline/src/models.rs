//! Records that flow through the pipeline

use chrono::{DateTime, Utc};
use resilience::ErrorClass;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Row-level change kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Truncate => "truncate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "truncate" => Ok(Operation::Truncate),
            other => Err(format!("Unknown operation: {}", other)),
        }
    }
}

/// One captured row change. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Source the event was captured from
    pub source_id: String,
    /// Source log position; compare with [`compare_positions`]
    pub position: String,
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub before: Option<Map<String, Value>>,
    pub after: Option<Map<String, Value>>,
    #[serde(default)]
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    /// `schema.table`, or just the table when the schema is empty
    pub fn qualified_table(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

/// An event held in the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Buffer-assigned, increasing in write order
    pub sequence_id: i64,
    pub event: Event,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl BufferedEvent {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Last committed source position, one per source id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub position: String,
    pub transaction_id: Option<String>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            position: position.into(),
            transaction_id: None,
            committed_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub id: Uuid,
    pub source_id: String,
    pub table_name: String,
    /// Buffer row this entry was taken from, if any
    pub buffer_id: Option<i64>,
    pub payload: Event,
    pub error_message: String,
    pub error_class: ErrorClass,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FailedEvent {
    pub fn new(
        event: Event,
        error_message: impl Into<String>,
        error_class: ErrorClass,
        retention: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let expires_at = retention
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .map(|r| now + r);

        Self {
            id: Uuid::new_v4(),
            source_id: event.source_id.clone(),
            table_name: event.qualified_table(),
            buffer_id: None,
            payload: event,
            error_message: error_message.into(),
            error_class,
            retry_count: 0,
            created_at: now,
            last_retry_at: None,
            expires_at,
        }
    }

    pub fn from_buffered(
        buffered: &BufferedEvent,
        error_message: impl Into<String>,
        error_class: ErrorClass,
        retention: Option<Duration>,
    ) -> Self {
        let mut failed = Self::new(
            buffered.event.clone(),
            error_message,
            error_class,
            retention,
        );
        failed.buffer_id = Some(buffered.sequence_id);
        failed
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// Order two source positions.
///
/// Understands PostgreSQL LSNs (`16/B374D848`) and plain integers, including
/// zero-padded ones. Anything else compares as text.
pub fn compare_positions(a: &str, b: &str) -> Ordering {
    if let (Some(x), Some(y)) = (parse_lsn(a), parse_lsn(b)) {
        return x.cmp(&y);
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn parse_lsn(position: &str) -> Option<u64> {
    let (hi, lo) = position.split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    Some((hi << 32) | lo)
}
