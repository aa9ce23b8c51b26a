//! Durable staging between capture and delivery

mod memory;
mod postgres;

pub use memory::MemoryEventBuffer;
pub use postgres::PgEventBuffer;

use crate::error::StoreResult;
use crate::models::{BufferedEvent, Event, FailedEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Unprocessed backlog of one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub depth: u64,
    /// `None` when nothing is waiting
    pub oldest_unprocessed_age: Option<Duration>,
}

#[async_trait]
pub trait EventBuffer: Send + Sync {
    /// Append events in order as one atomic unit. Returns the assigned
    /// sequence ids in the same order. Writing an event twice stores it twice.
    async fn write(&self, events: &[Event]) -> StoreResult<Vec<i64>>;

    /// Up to `limit` unprocessed events of `source_id`, oldest first.
    /// Does not claim or modify anything.
    async fn read_batch(&self, source_id: &str, limit: usize) -> StoreResult<Vec<BufferedEvent>>;

    /// Stamp `processed_at` on the given entries. Already-processed and
    /// unknown ids are ignored. Returns how many entries changed.
    async fn mark_processed(&self, ids: &[i64]) -> StoreResult<u64>;

    /// Delete processed entries created more than `retention` ago.
    /// Unprocessed entries are never removed.
    async fn cleanup(&self, retention: Duration) -> StoreResult<u64>;

    async fn stats(&self, source_id: &str) -> StoreResult<BufferStats>;

    /// Store dead-letter entries and mark their buffer rows processed in one
    /// atomic step, so an entry is either still pending or dead-lettered.
    async fn dead_letter(&self, entries: &[FailedEvent]) -> StoreResult<()>;
}
