use super::CheckpointStore;
use crate::error::StoreResult;
use crate::models::Checkpoint;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Process-local checkpoints for tests and `storage = "memory"`.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.checkpoints
            .lock()
            .await
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, source_id: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().await.get(source_id).cloned())
    }

    async fn delete(&self, source_id: &str) -> StoreResult<bool> {
        Ok(self.checkpoints.lock().await.remove(source_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Checkpoint>> {
        Ok(self.checkpoints.lock().await.values().cloned().collect())
    }
}
