use super::{BatchHandler, HandlerError};
use crate::models::{BufferedEvent, Operation};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes each batch as JSON lines under `<output_dir>/<schema.table>/`.
///
/// Files are named by the batch's sequence range and replaced atomically, so
/// delivering the same batch twice leaves one identical file.
pub struct JsonLinesSink {
    output_dir: PathBuf,
}

impl JsonLinesSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn check(event: &BufferedEvent) -> Result<(), HandlerError> {
        let e = &event.event;
        if e.table.is_empty() {
            return Err(HandlerError::schema(format!(
                "event {} has no table name",
                e.id
            )));
        }
        let has_image = match e.operation {
            Operation::Insert | Operation::Update => e.after.is_some(),
            Operation::Delete => e.before.is_some(),
            Operation::Truncate => true,
        };
        if !has_image {
            return Err(HandlerError::validation(format!(
                "{} event {} on {} is missing its row image",
                e.operation,
                e.id,
                e.qualified_table()
            )));
        }
        Ok(())
    }

    async fn write_file(&self, table: &str, events: &[&BufferedEvent]) -> Result<PathBuf, HandlerError> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Err(HandlerError::permanent("empty table group"));
        };

        let dir = self.output_dir.join(table);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HandlerError::transient(format!("create {}: {}", dir.display(), e)))?;

        let mut body = Vec::new();
        for event in events {
            serde_json::to_writer(&mut body, &event.event)
                .map_err(|e| HandlerError::permanent(format!("serialize {}: {}", event.event.id, e)))?;
            body.push(b'\n');
        }

        let name = format!("{:020}-{:020}.jsonl", first.sequence_id, last.sequence_id);
        let target = dir.join(&name);
        let staging = dir.join(format!(".{}.tmp", name));

        tokio::fs::write(&staging, &body)
            .await
            .map_err(|e| HandlerError::transient(format!("write {}: {}", staging.display(), e)))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| HandlerError::transient(format!("rename {}: {}", target.display(), e)))?;

        Ok(target)
    }
}

#[async_trait]
impl BatchHandler for JsonLinesSink {
    async fn handle(&self, batch: &[BufferedEvent]) -> Result<(), HandlerError> {
        for event in batch {
            Self::check(event)?;
        }

        let mut by_table: BTreeMap<String, Vec<&BufferedEvent>> = BTreeMap::new();
        for event in batch {
            by_table
                .entry(event.event.qualified_table())
                .or_default()
                .push(event);
        }

        for (table, events) in by_table {
            let path = self.write_file(&table, &events).await?;
            debug!(table = %table, count = events.len(), path = %path.display(), "Wrote batch file");
        }

        Ok(())
    }
}
