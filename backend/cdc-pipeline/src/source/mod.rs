//! Change sources

mod jsonl;

pub use jsonl::{ChangeEnvelope, JsonLinesSource};

use crate::models::{Checkpoint, Event};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Could not reach or open the source
    #[error("Source connection failed: {0}")]
    Connection(String),

    /// A record could not be turned into an [`Event`]
    #[error("Failed to decode change record: {0}")]
    Decode(String),

    /// The source cannot continue
    #[error("Fatal source error: {0}")]
    Fatal(String),

    #[error("Source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Channels handed out by [`Source::start`]
///
/// `events` closes when the source stops. Anything received on `errors` is
/// fatal to the pipeline.
pub struct SourceStreams {
    pub events: mpsc::Receiver<Event>,
    pub errors: mpsc::Receiver<SourceError>,
}

/// Produces ordered change events for one source id.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source id used for checkpoints and buffer rows
    fn name(&self) -> &str;

    /// Begin emitting events after `resume_from`, or from the source's own
    /// starting point when there is no checkpoint.
    async fn start(&self, resume_from: Option<Checkpoint>) -> Result<SourceStreams, SourceError>;

    async fn stop(&self) -> Result<(), SourceError>;

    /// Position of the most recently emitted event
    fn last_position(&self) -> Option<String>;
}
