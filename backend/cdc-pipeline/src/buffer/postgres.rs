use super::{BufferStats, EventBuffer};
use crate::dlq::insert_failed_event;
use crate::error::StoreResult;
use crate::models::{BufferedEvent, Event, FailedEvent};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Buffer rows in `pipeline_event_buffer`.
///
/// The BIGSERIAL id is the sequence id. Ordering per source holds as long as
/// a single writer appends for that source.
#[derive(Clone)]
pub struct PgEventBuffer {
    pool: PgPool,
}

impl PgEventBuffer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn buffered_from_row(row: &PgRow) -> StoreResult<BufferedEvent> {
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(BufferedEvent {
        sequence_id: row.try_get("id")?,
        event: serde_json::from_value(payload)?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl EventBuffer for PgEventBuffer {
    async fn write(&self, events: &[Event]) -> StoreResult<Vec<i64>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin buffer write transaction")?;

        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let payload = serde_json::to_value(event)?;
            let row = sqlx::query(
                r#"
                INSERT INTO pipeline_event_buffer (event_id, source_id, position, table_name, payload)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id
                "#,
            )
            .bind(event.id)
            .bind(&event.source_id)
            .bind(&event.position)
            .bind(event.qualified_table())
            .bind(payload)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert buffered event")?;

            ids.push(row.try_get::<i64, _>("id")?);
        }

        tx.commit()
            .await
            .context("Failed to commit buffer write")?;

        debug!(count = ids.len(), "Events written to buffer");
        Ok(ids)
    }

    async fn read_batch(&self, source_id: &str, limit: usize) -> StoreResult<Vec<BufferedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, created_at, processed_at
            FROM pipeline_event_buffer
            WHERE source_id = $1 AND processed_at IS NULL
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read buffer batch")?;

        rows.iter().map(buffered_from_row).collect()
    }

    async fn mark_processed(&self, ids: &[i64]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE pipeline_event_buffer
            SET processed_at = NOW()
            WHERE id = ANY($1) AND processed_at IS NULL
            "#,
        )
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await
        .context("Failed to mark buffered events processed")?;

        debug!(requested = ids.len(), marked = result.rows_affected(), "Buffered events marked processed");
        Ok(result.rows_affected())
    }

    async fn cleanup(&self, retention: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pipeline_event_buffer
            WHERE processed_at IS NOT NULL
              AND created_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("Failed to clean up event buffer")?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, retention_secs = retention.as_secs(), "Processed buffer entries removed");
        }
        Ok(removed)
    }

    async fn stats(&self, source_id: &str) -> StoreResult<BufferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS depth,
                EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::DOUBLE PRECISION AS age_seconds
            FROM pipeline_event_buffer
            WHERE source_id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute buffer stats")?;

        let depth: i64 = row.try_get("depth")?;
        let age: Option<f64> = row.try_get("age_seconds")?;

        Ok(BufferStats {
            depth: depth.max(0) as u64,
            oldest_unprocessed_age: age.map(|secs| Duration::from_secs_f64(secs.max(0.0))),
        })
    }

    async fn dead_letter(&self, entries: &[FailedEvent]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin dead letter transaction")?;

        for entry in entries {
            insert_failed_event(&mut *tx, entry).await?;
        }

        let buffer_ids: Vec<i64> = entries.iter().filter_map(|e| e.buffer_id).collect();
        sqlx::query(
            r#"
            UPDATE pipeline_event_buffer
            SET processed_at = NOW()
            WHERE id = ANY($1) AND processed_at IS NULL
            "#,
        )
        .bind(buffer_ids)
        .execute(&mut *tx)
        .await
        .context("Failed to acknowledge dead-lettered events")?;

        tx.commit()
            .await
            .context("Failed to commit dead letter transaction")?;

        warn!(count = entries.len(), "Events moved to dead letter store");
        Ok(())
    }
}
