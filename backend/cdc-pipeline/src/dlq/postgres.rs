use super::{DeadLetterStats, DeadLetterStore};
use crate::error::{StoreError, StoreResult};
use crate::models::FailedEvent;
use anyhow::Context;
use async_trait::async_trait;
use resilience::ErrorClass;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT id, source_id, table_name, buffer_id, payload, error_message, error_class,
           retry_count, created_at, last_retry_at, expires_at
    FROM pipeline_dead_letters
"#;

/// Dead letters in `pipeline_dead_letters`.
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, filter: &str, arg: Option<&str>, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        let sql = format!("{} {} ORDER BY created_at ASC, id ASC LIMIT $1", SELECT_COLUMNS, filter);
        let mut query = sqlx::query(&sql).bind(limit as i64);
        if let Some(arg) = arg {
            query = query.bind(arg);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to read dead letters")?;

        rows.iter().map(failed_event_from_row).collect()
    }
}

/// Insert one entry on an existing connection or transaction.
///
/// Re-inserting the same id is a no-op.
pub(crate) async fn insert_failed_event(conn: &mut PgConnection, entry: &FailedEvent) -> StoreResult<()> {
    let payload = serde_json::to_value(&entry.payload)?;

    sqlx::query(
        r#"
        INSERT INTO pipeline_dead_letters (
            id, source_id, table_name, buffer_id, payload, error_message, error_class,
            retry_count, created_at, last_retry_at, expires_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(entry.id)
    .bind(&entry.source_id)
    .bind(&entry.table_name)
    .bind(entry.buffer_id)
    .bind(payload)
    .bind(&entry.error_message)
    .bind(entry.error_class.as_str())
    .bind(entry.retry_count)
    .bind(entry.created_at)
    .bind(entry.last_retry_at)
    .bind(entry.expires_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert dead letter")?;

    Ok(())
}

fn failed_event_from_row(row: &PgRow) -> StoreResult<FailedEvent> {
    let class: String = row.try_get("error_class")?;
    let error_class: ErrorClass = class.parse().map_err(StoreError::Invalid)?;
    let payload: serde_json::Value = row.try_get("payload")?;

    Ok(FailedEvent {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        table_name: row.try_get("table_name")?,
        buffer_id: row.try_get("buffer_id")?,
        payload: serde_json::from_value(payload)?,
        error_message: row.try_get("error_message")?,
        error_class,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        last_retry_at: row.try_get("last_retry_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn grouped_counts(rows: &[PgRow]) -> StoreResult<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let n: i64 = row.try_get("n")?;
        counts.insert(key, n.max(0) as u64);
    }
    Ok(counts)
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn write(&self, entry: &FailedEvent) -> StoreResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for dead letter")?;
        insert_failed_event(&mut *conn, entry).await?;

        warn!(
            dead_letter_id = %entry.id,
            source_id = %entry.source_id,
            table = %entry.table_name,
            error_class = %entry.error_class,
            "Event written to dead letter store"
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FailedEvent>> {
        let sql = format!("{} WHERE id = $1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load dead letter")?;

        row.as_ref().map(failed_event_from_row).transpose()
    }

    async fn read(&self, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        self.fetch("", None, limit).await
    }

    async fn read_by_source(&self, source_id: &str, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        self.fetch("WHERE source_id = $2", Some(source_id), limit).await
    }

    async fn read_by_table(&self, table_name: &str, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        self.fetch("WHERE table_name = $2", Some(table_name), limit).await
    }

    async fn mark_retried(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_dead_letters
            SET retry_count = retry_count + 1,
                last_retry_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark dead letter retried")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dead letter {}", id)));
        }

        debug!(dead_letter_id = %id, "Dead letter marked retried");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pipeline_dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete dead letter")?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM pipeline_dead_letters WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .context("Failed to clean up expired dead letters")?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Expired dead letters removed");
        }
        Ok(removed)
    }

    async fn stats(&self) -> StoreResult<DeadLetterStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS total, MIN(created_at) AS oldest, MAX(created_at) AS newest
            FROM pipeline_dead_letters
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute dead letter totals")?;

        let by_source = sqlx::query(
            "SELECT source_id AS key, COUNT(*)::BIGINT AS n FROM pipeline_dead_letters GROUP BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count dead letters by source")?;

        let by_class = sqlx::query(
            "SELECT error_class AS key, COUNT(*)::BIGINT AS n FROM pipeline_dead_letters GROUP BY error_class",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count dead letters by class")?;

        let total: i64 = totals.try_get("total")?;
        Ok(DeadLetterStats {
            total: total.max(0) as u64,
            by_source: grouped_counts(&by_source)?,
            by_class: grouped_counts(&by_class)?,
            oldest: totals.try_get("oldest")?,
            newest: totals.try_get("newest")?,
        })
    }
}
