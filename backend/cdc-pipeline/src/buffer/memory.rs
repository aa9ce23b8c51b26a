use super::{BufferStats, EventBuffer};
use crate::dlq::MemoryDeadLetterStore;
use crate::error::StoreResult;
use crate::models::{BufferedEvent, Event, FailedEvent};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Entries {
    next_id: i64,
    rows: BTreeMap<i64, BufferedEvent>,
}

/// Process-local buffer. Dead letters go to the paired in-memory store.
pub struct MemoryEventBuffer {
    entries: Mutex<Entries>,
    dead_letters: Arc<MemoryDeadLetterStore>,
}

impl MemoryEventBuffer {
    pub fn new(dead_letters: Arc<MemoryDeadLetterStore>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            dead_letters,
        }
    }

    /// Every entry, processed or not, in sequence order.
    pub async fn snapshot(&self) -> Vec<BufferedEvent> {
        self.entries.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl EventBuffer for MemoryEventBuffer {
    async fn write(&self, events: &[Event]) -> StoreResult<Vec<i64>> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(events.len());

        for event in events {
            entries.next_id += 1;
            let id = entries.next_id;
            entries.rows.insert(
                id,
                BufferedEvent {
                    sequence_id: id,
                    event: event.clone(),
                    created_at: now,
                    processed_at: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn read_batch(&self, source_id: &str, limit: usize) -> StoreResult<Vec<BufferedEvent>> {
        Ok(self
            .entries
            .lock()
            .await
            .rows
            .values()
            .filter(|e| e.processed_at.is_none() && e.event.source_id == source_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let mut marked = 0;
        for id in ids {
            if let Some(entry) = entries.rows.get_mut(id) {
                if entry.processed_at.is_none() {
                    entry.processed_at = Some(now);
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn cleanup(&self, retention: Duration) -> StoreResult<u64> {
        let cutoff = match chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        {
            Some(cutoff) => cutoff,
            None => return Ok(0),
        };
        let mut entries = self.entries.lock().await;
        let before = entries.rows.len();
        entries
            .rows
            .retain(|_, e| e.processed_at.is_none() || e.created_at > cutoff);
        Ok((before - entries.rows.len()) as u64)
    }

    async fn stats(&self, source_id: &str) -> StoreResult<BufferStats> {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        let mut stats = BufferStats::default();

        for entry in entries
            .rows
            .values()
            .filter(|e| e.processed_at.is_none() && e.event.source_id == source_id)
        {
            stats.depth += 1;
            if stats.oldest_unprocessed_age.is_none() {
                // rows are in sequence order, so the first is the oldest
                stats.oldest_unprocessed_age = Some((now - entry.created_at).to_std().unwrap_or_default());
            }
        }
        Ok(stats)
    }

    async fn dead_letter(&self, failed: &[FailedEvent]) -> StoreResult<()> {
        // Holding the buffer lock across both writes keeps readers from seeing
        // an entry that is dead-lettered but still pending.
        let mut entries = self.entries.lock().await;
        self.dead_letters.write_all(failed).await;

        let ids: HashSet<i64> = failed.iter().filter_map(|f| f.buffer_id).collect();
        let now = Utc::now();
        for id in ids {
            if let Some(entry) = entries.rows.get_mut(&id) {
                entry.processed_at.get_or_insert(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DeadLetterStore;
    use crate::models::tests::sample_event;
    use resilience::ErrorClass;

    fn buffer() -> (MemoryEventBuffer, Arc<MemoryDeadLetterStore>) {
        let dead_letters = Arc::new(MemoryDeadLetterStore::new());
        (MemoryEventBuffer::new(dead_letters.clone()), dead_letters)
    }

    #[tokio::test]
    async fn test_read_batch_is_ordered_and_non_destructive() {
        let (buffer, _) = buffer();
        let events: Vec<_> = (1..=5).map(|n| sample_event("a", n)).collect();
        let ids = buffer.write(&events).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let first = buffer.read_batch("a", 3).await.unwrap();
        let again = buffer.read_batch("a", 3).await.unwrap();
        assert_eq!(first, again);

        let positions: Vec<_> = first.iter().map(|e| e.event.position.clone()).collect();
        assert_eq!(
            positions,
            vec![events[0].position.clone(), events[1].position.clone(), events[2].position.clone()]
        );
    }

    #[tokio::test]
    async fn test_read_batch_filters_by_source() {
        let (buffer, _) = buffer();
        buffer
            .write(&[sample_event("a", 1), sample_event("b", 1), sample_event("a", 2)])
            .await
            .unwrap();

        let batch = buffer.read_batch("a", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.event.source_id == "a"));
    }

    #[tokio::test]
    async fn test_mark_processed_is_idempotent() {
        let (buffer, _) = buffer();
        let ids = buffer
            .write(&[sample_event("a", 1), sample_event("a", 2)])
            .await
            .unwrap();

        assert_eq!(buffer.mark_processed(&ids).await.unwrap(), 2);
        let first = buffer.snapshot().await;

        assert_eq!(buffer.mark_processed(&ids).await.unwrap(), 0);
        assert_eq!(buffer.mark_processed(&[999]).await.unwrap(), 0);
        assert_eq!(buffer.snapshot().await, first);
    }

    #[tokio::test]
    async fn test_cleanup_never_removes_unprocessed() {
        let (buffer, _) = buffer();
        let events: Vec<_> = (1..=5).map(|n| sample_event("a", n)).collect();
        let ids = buffer.write(&events).await.unwrap();
        buffer.mark_processed(&ids[..2]).await.unwrap();

        assert_eq!(buffer.cleanup(Duration::ZERO).await.unwrap(), 2);

        let remaining = buffer.snapshot().await;
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|e| !e.is_processed()));
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let (buffer, _) = buffer();
        let ids = buffer.write(&[sample_event("a", 1)]).await.unwrap();
        buffer.mark_processed(&ids).await.unwrap();

        assert_eq!(buffer.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(buffer.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_reports_depth_and_age() {
        let (buffer, _) = buffer();
        assert_eq!(buffer.stats("a").await.unwrap(), BufferStats::default());

        let ids = buffer
            .write(&[sample_event("a", 1), sample_event("a", 2), sample_event("b", 1)])
            .await
            .unwrap();
        buffer.mark_processed(&ids[..1]).await.unwrap();

        let stats = buffer.stats("a").await.unwrap();
        assert_eq!(stats.depth, 1);
        assert!(stats.oldest_unprocessed_age.is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_is_atomic_with_ack() {
        let (buffer, dead_letters) = buffer();
        buffer
            .write(&[sample_event("a", 1), sample_event("a", 2)])
            .await
            .unwrap();

        let batch = buffer.read_batch("a", 10).await.unwrap();
        let failed: Vec<_> = batch
            .iter()
            .map(|e| FailedEvent::from_buffered(e, "rejected", ErrorClass::Permanent, None))
            .collect();
        buffer.dead_letter(&failed).await.unwrap();

        assert!(buffer.read_batch("a", 10).await.unwrap().is_empty());
        assert_eq!(dead_letters.stats().await.unwrap().total, 2);
    }
}
