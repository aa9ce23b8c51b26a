//! Durable per-source position storage

mod memory;
mod postgres;

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;

use crate::error::StoreResult;
use crate::models::Checkpoint;
use async_trait::async_trait;

/// Upsert-by-source-id position store.
///
/// Positions are not required to advance monotonically; saving an older
/// position rewinds the source on the next restart.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for `checkpoint.source_id`.
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()>;

    /// `Ok(None)` when the source has never been checkpointed.
    async fn load(&self, source_id: &str) -> StoreResult<Option<Checkpoint>>;

    /// Forget the source's position, forcing a full resync. Returns whether
    /// a checkpoint existed.
    async fn delete(&self, source_id: &str) -> StoreResult<bool>;

    /// Every stored checkpoint, ordered by source id.
    async fn list(&self) -> StoreResult<Vec<Checkpoint>>;
}
