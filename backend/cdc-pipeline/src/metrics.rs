use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Pipeline counters and gauges, labelled with the source id.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_buffered: IntCounter,
    pub batches_delivered: IntCounter,
    pub events_delivered: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub delivery_failures: IntCounter,
    pub buffer_depth: IntGauge,
    pub oldest_unprocessed_age_seconds: IntGauge,
    pub paused: IntGauge,
    pub checkpoint_saves: IntCounter,
    pub state: IntGauge,
}

fn counter(name: &str, help: &str, source_id: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("source_id", source_id.to_string()))
        .expect("valid metric opts")
}

fn gauge(name: &str, help: &str, source_id: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("source_id", source_id.to_string()))
        .expect("valid metric opts")
}

impl PipelineMetrics {
    /// Create and register in the default registry. Registering the same
    /// source twice logs a warning and leaves the first set exported.
    pub fn new(source_id: &str) -> Self {
        let metrics = Self::unregistered(source_id);
        let registry = prometheus::default_registry();

        for metric in [
            Box::new(metrics.events_buffered.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(metrics.batches_delivered.clone()),
            Box::new(metrics.events_delivered.clone()),
            Box::new(metrics.events_dead_lettered.clone()),
            Box::new(metrics.delivery_failures.clone()),
            Box::new(metrics.buffer_depth.clone()),
            Box::new(metrics.oldest_unprocessed_age_seconds.clone()),
            Box::new(metrics.paused.clone()),
            Box::new(metrics.checkpoint_saves.clone()),
            Box::new(metrics.state.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register pipeline metric: {}", e);
            }
        }

        metrics
    }

    /// Metrics that are tracked but not exported. Used by tests.
    pub fn unregistered(source_id: &str) -> Self {
        Self {
            events_buffered: counter(
                "pipeline_events_buffered_total",
                "Events accepted into the buffer",
                source_id,
            ),
            batches_delivered: counter(
                "pipeline_batches_delivered_total",
                "Batches acknowledged by the handler",
                source_id,
            ),
            events_delivered: counter(
                "pipeline_events_delivered_total",
                "Events acknowledged by the handler",
                source_id,
            ),
            events_dead_lettered: counter(
                "pipeline_events_dead_lettered_total",
                "Events moved to the dead letter store",
                source_id,
            ),
            delivery_failures: counter(
                "pipeline_delivery_failures_total",
                "Batches whose delivery gave up",
                source_id,
            ),
            buffer_depth: gauge(
                "pipeline_buffer_depth",
                "Unprocessed events waiting in the buffer",
                source_id,
            ),
            oldest_unprocessed_age_seconds: gauge(
                "pipeline_buffer_oldest_unprocessed_age_seconds",
                "Age of the oldest unprocessed buffer entry",
                source_id,
            ),
            paused: gauge(
                "pipeline_backpressure_paused",
                "1 while ingestion is paused by backpressure",
                source_id,
            ),
            checkpoint_saves: counter(
                "pipeline_checkpoint_saves_total",
                "Checkpoints persisted",
                source_id,
            ),
            state: gauge(
                "pipeline_state",
                "Lifecycle state: 0 starting, 1 running, 2 paused, 3 stopping, 4 stopped, 5 failed",
                source_id,
            ),
        }
    }
}
