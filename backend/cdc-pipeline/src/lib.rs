//! Change-data-capture pipeline core
//!
//! Events read from a [`source::Source`] are staged in a durable
//! [`buffer::EventBuffer`], delivered in order by the
//! [`batch_processor::BatchProcessor`] to a [`handler::BatchHandler`], and
//! moved to the [`dlq::DeadLetterStore`] when delivery gives up. The
//! [`coordinator::PipelineCoordinator`] ties the pieces together and owns the
//! checkpoint.

pub mod backpressure;
pub mod batch_processor;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod source;
pub mod state;
pub mod stores;

pub use config::PipelineConfig;
pub use coordinator::{PipelineComponents, PipelineCoordinator, PipelineHandle, PipelineSettings};
pub use error::{PipelineError, PipelineResult, StoreError, StoreResult};
pub use state::PipelineState;
