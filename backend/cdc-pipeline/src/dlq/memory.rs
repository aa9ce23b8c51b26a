use super::{DeadLetterStats, DeadLetterStore};
use crate::error::{StoreError, StoreResult};
use crate::models::FailedEvent;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local dead letters, kept in insertion order.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<FailedEvent>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert several entries under one lock; known ids are skipped.
    pub(crate) async fn write_all(&self, batch: &[FailedEvent]) {
        let mut entries = self.entries.lock().await;
        for entry in batch {
            if !entries.iter().any(|e| e.id == entry.id) {
                entries.push(entry.clone());
            }
        }
    }

    async fn filtered<F>(&self, limit: usize, keep: F) -> Vec<FailedEvent>
    where
        F: Fn(&FailedEvent) -> bool,
    {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| keep(e))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn write(&self, entry: &FailedEvent) -> StoreResult<()> {
        self.write_all(std::slice::from_ref(entry)).await;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<FailedEvent>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn read(&self, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        Ok(self.filtered(limit, |_| true).await)
    }

    async fn read_by_source(&self, source_id: &str, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        Ok(self.filtered(limit, |e| e.source_id == source_id).await)
    }

    async fn read_by_table(&self, table_name: &str, limit: usize) -> StoreResult<Vec<FailedEvent>> {
        Ok(self.filtered(limit, |e| e.table_name == table_name).await)
    }

    async fn mark_retried(&self, id: Uuid) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", id)))?;
        entry.retry_count += 1;
        entry.last_retry_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }

    async fn cleanup(&self) -> StoreResult<u64> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !e.is_expired_at(now));
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> StoreResult<DeadLetterStats> {
        let entries = self.entries.lock().await;
        let mut stats = DeadLetterStats {
            total: entries.len() as u64,
            ..Default::default()
        };

        for entry in entries.iter() {
            *stats.by_source.entry(entry.source_id.clone()).or_default() += 1;
            *stats
                .by_class
                .entry(entry.error_class.as_str().to_string())
                .or_default() += 1;
            stats.oldest = Some(stats.oldest.map_or(entry.created_at, |o| o.min(entry.created_at)));
            stats.newest = Some(stats.newest.map_or(entry.created_at, |n| n.max(entry.created_at)));
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::sample_event;
    use resilience::ErrorClass;
    use std::time::Duration;

    fn entry(source: &str, table: &str, class: ErrorClass) -> FailedEvent {
        let mut event = sample_event(source, 1);
        event.table = table.to_string();
        FailedEvent::new(event, "failed", class, None)
    }

    #[tokio::test]
    async fn test_reads_are_fifo_and_filtered() {
        let store = MemoryDeadLetterStore::new();
        let first = entry("a", "orders", ErrorClass::Permanent);
        let second = entry("b", "orders", ErrorClass::Transient);
        let third = entry("a", "users", ErrorClass::Schema);
        for e in [&first, &second, &third] {
            store.write(e).await.unwrap();
        }

        let all: Vec<_> = store.read(10).await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(all, vec![first.id, second.id, third.id]);

        assert_eq!(store.read(2).await.unwrap().len(), 2);

        let by_source: Vec<_> = store
            .read_by_source("a", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(by_source, vec![first.id, third.id]);

        let by_table = store.read_by_table("public.orders", 10).await.unwrap();
        assert_eq!(by_table.len(), 2);
    }

    #[tokio::test]
    async fn test_write_is_idempotent_per_id() {
        let store = MemoryDeadLetterStore::new();
        let e = entry("a", "orders", ErrorClass::Permanent);
        store.write(&e).await.unwrap();
        store.write(&e).await.unwrap();
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_mark_retried_and_delete() {
        let store = MemoryDeadLetterStore::new();
        let e = entry("a", "orders", ErrorClass::Permanent);
        store.write(&e).await.unwrap();

        store.mark_retried(e.id).await.unwrap();
        store.mark_retried(e.id).await.unwrap();
        assert_eq!(store.get(e.id).await.unwrap().unwrap().retry_count, 2);

        assert!(store.delete(e.id).await.unwrap());
        assert!(!store.delete(e.id).await.unwrap());
        assert!(matches!(
            store.mark_retried(e.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = MemoryDeadLetterStore::new();
        let mut expired = entry("a", "orders", ErrorClass::Permanent);
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let live = FailedEvent::new(
            sample_event("a", 2),
            "x",
            ErrorClass::Permanent,
            Some(Duration::from_secs(3600)),
        );
        let forever = entry("a", "orders", ErrorClass::Unknown);
        for e in [&expired, &live, &forever] {
            store.write(e).await.unwrap();
        }

        assert_eq!(store.cleanup().await.unwrap(), 1);
        assert!(store.get(expired.id).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_stats_group_by_source_and_class() {
        let store = MemoryDeadLetterStore::new();
        store.write(&entry("a", "t", ErrorClass::Permanent)).await.unwrap();
        store.write(&entry("a", "t", ErrorClass::Validation)).await.unwrap();
        store.write(&entry("b", "t", ErrorClass::Permanent)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_source["a"], 2);
        assert_eq!(stats.by_source["b"], 1);
        assert_eq!(stats.by_class["permanent"], 2);
        assert_eq!(stats.by_class["validation"], 1);
        assert!(stats.oldest.unwrap() <= stats.newest.unwrap());
    }
}
