//! Dead-letter storage for events that could not be delivered

mod memory;
mod postgres;

pub use memory::MemoryDeadLetterStore;
pub use postgres::PgDeadLetterStore;
pub(crate) use postgres::insert_failed_event;

use crate::buffer::EventBuffer;
use crate::error::{StoreError, StoreResult};
use crate::models::FailedEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_source: BTreeMap<String, u64>,
    pub by_class: BTreeMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Reads return entries oldest first.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn write(&self, entry: &FailedEvent) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<FailedEvent>>;

    async fn read(&self, limit: usize) -> StoreResult<Vec<FailedEvent>>;

    async fn read_by_source(&self, source_id: &str, limit: usize) -> StoreResult<Vec<FailedEvent>>;

    async fn read_by_table(&self, table_name: &str, limit: usize) -> StoreResult<Vec<FailedEvent>>;

    /// Bump the retry count and stamp `last_retry_at`.
    async fn mark_retried(&self, id: Uuid) -> StoreResult<()>;

    /// Returns whether the entry existed.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;

    /// Remove expired entries, returning how many were removed.
    async fn cleanup(&self) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<DeadLetterStats>;
}

/// Puts dead-lettered events back into the buffer for another delivery attempt.
pub struct DeadLetterReplayer {
    dead_letters: Arc<dyn DeadLetterStore>,
    buffer: Arc<dyn EventBuffer>,
}

impl DeadLetterReplayer {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>, buffer: Arc<dyn EventBuffer>) -> Self {
        Self {
            dead_letters,
            buffer,
        }
    }

    /// Re-buffer one entry's original event and mark the entry retried.
    ///
    /// The entry stays in the store so a repeated failure is visible as a
    /// higher retry count. Returns the new buffer sequence id.
    pub async fn replay(&self, id: Uuid) -> StoreResult<i64> {
        let entry = self
            .dead_letters
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", id)))?;

        let ids = self.buffer.write(std::slice::from_ref(&entry.payload)).await?;
        self.dead_letters.mark_retried(id).await?;

        let sequence_id = ids
            .first()
            .copied()
            .ok_or_else(|| StoreError::Invalid("buffer returned no sequence id".to_string()))?;

        info!(
            dead_letter_id = %id,
            source_id = %entry.source_id,
            sequence_id,
            retry_count = entry.retry_count + 1,
            "Dead letter replayed into buffer"
        );
        Ok(sequence_id)
    }

    /// Replay up to `limit` of a source's oldest entries.
    pub async fn replay_source(&self, source_id: &str, limit: usize) -> StoreResult<usize> {
        let entries = self.dead_letters.read_by_source(source_id, limit).await?;
        for entry in &entries {
            self.replay(entry.id).await?;
        }
        Ok(entries.len())
    }
}
