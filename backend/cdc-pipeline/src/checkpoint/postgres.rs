use super::CheckpointStore;
use crate::error::StoreResult;
use crate::models::Checkpoint;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Checkpoints in `pipeline_checkpoints`, one row per source.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn checkpoint_from_row(row: &PgRow) -> StoreResult<Checkpoint> {
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let metadata: BTreeMap<String, String> = serde_json::from_value(metadata)?;

    Ok(Checkpoint {
        source_id: row.try_get("source_id")?,
        position: row.try_get("position")?,
        transaction_id: row.try_get("transaction_id")?,
        committed_at: row.try_get("committed_at")?,
        metadata,
    })
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let metadata = serde_json::to_value(&checkpoint.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoints (source_id, position, transaction_id, committed_at, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id)
            DO UPDATE SET
                position = EXCLUDED.position,
                transaction_id = EXCLUDED.transaction_id,
                committed_at = EXCLUDED.committed_at,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&checkpoint.source_id)
        .bind(&checkpoint.position)
        .bind(&checkpoint.transaction_id)
        .bind(checkpoint.committed_at)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .context("Failed to save checkpoint")?;

        debug!(
            source_id = %checkpoint.source_id,
            position = %checkpoint.position,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, source_id: &str) -> StoreResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, position, transaction_id, committed_at, metadata
            FROM pipeline_checkpoints
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load checkpoint")?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn delete(&self, source_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pipeline_checkpoints WHERE source_id = $1")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete checkpoint")?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(source_id = %source_id, "Checkpoint deleted; source will resync");
        }
        Ok(deleted)
    }

    async fn list(&self) -> StoreResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, position, transaction_id, committed_at, metadata
            FROM pipeline_checkpoints
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list checkpoints")?;

        rows.iter().map(checkpoint_from_row).collect()
    }
}
