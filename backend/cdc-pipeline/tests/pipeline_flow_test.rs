//! End-to-end pipeline behaviour over in-memory stores
//!
//! Covers:
//! 1. Clean run: every event delivered once, in order, checkpoint at the end
//! 2. Restart resumes after the saved checkpoint
//! 3. Accepted but undelivered events survive a restart
//! 4. Permanently failing events land in the dead-letter store
//! 5. Fatal source errors fail the pipeline but still checkpoint
//! 6. Manual pause and backpressure pause
//! 7. A crash between periodic checkpoints replays without gaps
//! 8. A buffer write that outlives the grace period fails the pipeline

mod common;

use cdc_pipeline::backpressure::BackpressureThresholds;
use cdc_pipeline::buffer::EventBuffer;
use cdc_pipeline::checkpoint::CheckpointStore;
use cdc_pipeline::dlq::DeadLetterStore;
use cdc_pipeline::metrics::PipelineMetrics;
use cdc_pipeline::models::Checkpoint;
use cdc_pipeline::stores::Stores;
use cdc_pipeline::{PipelineCoordinator, PipelineError, PipelineResult, PipelineState};
use common::*;
use resilience::ErrorClass;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_test::assert_ok;

fn coordinator(
    settings: cdc_pipeline::PipelineSettings,
    source: Arc<ScriptedSource>,
    handler: Arc<RecordingHandler>,
    stores: &Stores,
) -> Arc<PipelineCoordinator> {
    Arc::new(PipelineCoordinator::new(
        settings,
        components(source, handler, stores),
        PipelineMetrics::unregistered(SOURCE_ID),
    ))
}

fn spawn_pipeline(
    coordinator: Arc<PipelineCoordinator>,
) -> (watch::Sender<bool>, JoinHandle<PipelineResult<()>>) {
    let (tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { coordinator.run(rx).await });
    (tx, run)
}

async fn wait_for_depth(stores: &Stores, depth: u64) {
    for _ in 0..1000 {
        if stores.buffer.stats(SOURCE_ID).await.unwrap().depth == depth {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("buffer never reached depth {}", depth);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn positions(range: std::ops::RangeInclusive<u64>) -> Vec<String> {
    range.map(position).collect()
}

#[tokio::test]
async fn test_clean_run_delivers_in_order_and_checkpoints() {
    let stores = Stores::in_memory();
    let source = ScriptedSource::new(events(1..=10));
    let handler = RecordingHandler::new();
    let pipeline = coordinator(fast_settings(), source.clone(), handler.clone(), &stores);

    let (shutdown, run) = spawn_pipeline(pipeline.clone());
    eventually("all events delivered", || handler.delivered().len() == 10).await;

    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(handler.delivered_positions(), positions(1..=10));

    let checkpoint = stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.position, position(10));
    assert_eq!(checkpoint.transaction_id.as_deref(), Some("tx-10"));

    assert_eq!(stores.buffer.stats(SOURCE_ID).await.unwrap().depth, 0);
    assert_eq!(stores.dead_letters.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let stores = Stores::in_memory();

    let first_handler = RecordingHandler::new();
    let first = coordinator(
        fast_settings(),
        ScriptedSource::new(events(1..=5)),
        first_handler.clone(),
        &stores,
    );
    let (shutdown, run) = spawn_pipeline(first);
    eventually("first run delivered", || first_handler.delivered().len() == 5).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    // the source's log has grown while the pipeline was down
    let source = ScriptedSource::new(events(1..=10));
    let handler = RecordingHandler::new();
    let second = coordinator(fast_settings(), source.clone(), handler.clone(), &stores);
    let (shutdown, run) = spawn_pipeline(second);
    eventually("second run delivered", || handler.delivered().len() == 5).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    assert_eq!(source.resumed_from(), Some(position(5)));
    assert_eq!(handler.delivered_positions(), positions(6..=10));
    assert_eq!(
        stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
        position(10)
    );
}

#[tokio::test]
async fn test_undelivered_events_survive_restart() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();
    settings.retry.max_attempts = 10_000;

    let offline = RecordingHandler::new();
    offline.set_offline(true);
    let first = coordinator(
        settings.clone(),
        ScriptedSource::new(events(1..=4)),
        offline.clone(),
        &stores,
    );
    let (shutdown, run) = spawn_pipeline(first);
    wait_for_depth(&stores, 4).await;
    sleep(Duration::from_millis(50)).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    // accepted, checkpointed, but never delivered
    assert!(offline.delivered().is_empty());
    assert_eq!(
        stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
        position(4)
    );
    assert_eq!(stores.buffer.stats(SOURCE_ID).await.unwrap().depth, 4);

    let source = ScriptedSource::new(events(1..=4));
    let handler = RecordingHandler::new();
    let second = coordinator(settings, source.clone(), handler.clone(), &stores);
    let (shutdown, run) = spawn_pipeline(second);
    eventually("buffered backlog delivered", || handler.delivered().len() == 4).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    assert_eq!(source.resumed_from(), Some(position(4)));
    assert_eq!(handler.delivered_positions(), positions(1..=4));
    assert_eq!(stores.dead_letters.stats().await.unwrap().total, 0);
}

#[test]
fn test_crash_between_checkpoints_replays_without_gaps() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();

    let first = RecordingHandler::new();
    runtime().block_on(async {
        let pipeline = coordinator(
            settings.clone(),
            ScriptedSource::new(events(1..=2)),
            first.clone(),
            &stores,
        );
        let (shutdown, run) = spawn_pipeline(pipeline);
        eventually("first run delivered", || first.delivered().len() == 2).await;
        shutdown.send(true).unwrap();
        assert_ok!(run.await.unwrap());
    });

    // no periodic save happens before the crash
    settings.checkpoint_interval = Duration::from_secs(3600);
    let crashed = RecordingHandler::new();
    let doomed = runtime();
    doomed.block_on(async {
        let pipeline = coordinator(
            settings.clone(),
            ScriptedSource::new(events(1..=6)),
            crashed.clone(),
            &stores,
        );
        let (_shutdown, _run) = spawn_pipeline(pipeline);
        eventually("events accepted before the crash", || crashed.delivered().len() == 4).await;
    });
    // tears down every pipeline task without a final checkpoint
    drop(doomed);

    let source = ScriptedSource::new(events(1..=6));
    let handler = RecordingHandler::new();
    runtime().block_on(async {
        assert_eq!(
            stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
            position(2)
        );

        let pipeline = coordinator(settings, source.clone(), handler.clone(), &stores);
        let (shutdown, run) = spawn_pipeline(pipeline);
        eventually("replay delivered", || {
            handler.delivered_positions().contains(&position(6))
        })
        .await;
        shutdown.send(true).unwrap();
        assert_ok!(run.await.unwrap());

        assert_eq!(
            stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
            position(6)
        );
    });

    assert_eq!(source.resumed_from(), Some(position(2)));
    let replayed = handler.delivered_positions();
    for expected in positions(3..=6) {
        assert!(replayed.contains(&expected), "{} was skipped", expected);
    }
    // delivered again after the crash, not lost
    assert_eq!(crashed.delivered_positions(), positions(3..=6));
}

#[tokio::test]
async fn test_hung_buffer_write_fails_after_grace_period() {
    let stores = Stores::in_memory();
    stores
        .checkpoints
        .save(&Checkpoint::new(SOURCE_ID, position(2)))
        .await
        .unwrap();

    let mut settings = fast_settings();
    settings.shutdown_grace_period = Duration::from_millis(200);

    let buffer = HangingBuffer::new(stores.buffer.clone());
    let mut parts = components(ScriptedSource::new(events(1..=5)), RecordingHandler::new(), &stores);
    parts.buffer = buffer.clone() as Arc<dyn EventBuffer>;
    let pipeline = Arc::new(PipelineCoordinator::new(
        settings,
        parts,
        PipelineMetrics::unregistered(SOURCE_ID),
    ));

    let (shutdown, run) = spawn_pipeline(pipeline.clone());
    eventually("buffer write in flight", || buffer.writes() > 0).await;
    shutdown.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("run returns once the grace period is spent")
        .unwrap();

    assert!(matches!(result, Err(PipelineError::ShutdownTimeout(_))));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    // the hung events were never accepted
    assert_eq!(
        stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
        position(2)
    );
}

#[tokio::test]
async fn test_permanent_failure_is_dead_lettered_and_rest_delivered() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();
    settings.batch.batch_size = 1;

    let backlog = vec![
        event(1, "orders"),
        event(2, "legacy_blobs"),
        event(3, "orders"),
        event(4, "orders"),
    ];
    let handler = RecordingHandler::with_poison(&["legacy_blobs"]);
    let pipeline = coordinator(settings, ScriptedSource::new(backlog), handler.clone(), &stores);

    let (shutdown, run) = spawn_pipeline(pipeline);
    eventually("healthy events delivered", || handler.delivered().len() == 3).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    assert_eq!(
        handler.delivered_positions(),
        vec![position(1), position(3), position(4)]
    );

    let dead = stores.dead_letters.read_by_source(SOURCE_ID, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.position, position(2));
    assert_eq!(dead[0].table_name, "public.legacy_blobs");
    assert_eq!(dead[0].error_class, ErrorClass::Permanent);
    assert!(dead[0].buffer_id.is_some());

    // dead-lettered entries are acknowledged in the buffer
    assert_eq!(stores.buffer.stats(SOURCE_ID).await.unwrap().depth, 0);
}

#[tokio::test]
async fn test_fatal_source_error_fails_pipeline_and_checkpoints() {
    let stores = Stores::in_memory();
    let source = ScriptedSource::new(events(1..=3));
    let handler = RecordingHandler::new();
    let pipeline = coordinator(fast_settings(), source.clone(), handler.clone(), &stores);

    let (_shutdown, run) = spawn_pipeline(pipeline.clone());
    eventually("backlog delivered", || handler.delivered().len() == 3).await;

    source.fail("replication slot dropped").await;
    let result = run.await.unwrap();

    assert!(matches!(result, Err(PipelineError::Source(_))));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(
        stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
        position(3)
    );
}

#[tokio::test]
async fn test_source_end_of_stream_stops_cleanly() {
    let stores = Stores::in_memory();
    let source = ScriptedSource::new(events(1..=3));
    let pipeline = coordinator(fast_settings(), source.clone(), RecordingHandler::new(), &stores);

    let (_shutdown, run) = spawn_pipeline(pipeline.clone());
    eventually("pipeline running", || pipeline.state() == PipelineState::Running).await;
    source.close();

    assert_ok!(run.await.unwrap());
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(
        stores.checkpoints.load(SOURCE_ID).await.unwrap().unwrap().position,
        position(3)
    );
}

#[tokio::test]
async fn test_checkpointing_disabled_replays_from_start() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();
    settings.checkpoint_enabled = false;

    let source = ScriptedSource::new(events(1..=2));
    let handler = RecordingHandler::new();
    let pipeline = coordinator(settings, source.clone(), handler.clone(), &stores);

    let (shutdown, run) = spawn_pipeline(pipeline);
    eventually("delivered", || handler.delivered().len() == 2).await;
    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());

    assert_eq!(source.resumed_from(), None);
    assert!(stores.checkpoints.load(SOURCE_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pause_rejected_before_running() {
    let stores = Stores::in_memory();
    let pipeline = coordinator(
        fast_settings(),
        ScriptedSource::new(Vec::new()),
        RecordingHandler::new(),
        &stores,
    );

    assert_eq!(pipeline.state(), PipelineState::Starting);
    assert!(matches!(
        pipeline.handle().pause(),
        Err(PipelineError::IllegalTransition { .. })
    ));
}

#[tokio::test]
async fn test_manual_pause_holds_ingestion_until_resume() {
    let stores = Stores::in_memory();
    let source = ScriptedSource::new(Vec::new());
    let handler = RecordingHandler::new();
    let pipeline = coordinator(fast_settings(), source.clone(), handler.clone(), &stores);
    let handle = pipeline.handle();

    let (shutdown, run) = spawn_pipeline(pipeline.clone());
    eventually("pipeline running", || handle.state() == PipelineState::Running).await;

    assert!(handle.pause().unwrap());
    assert!(!handle.pause().unwrap());
    source.push(event(1, "orders")).await;

    sleep(Duration::from_millis(100)).await;
    assert!(handler.delivered().is_empty());
    assert_eq!(stores.buffer.stats(SOURCE_ID).await.unwrap().depth, 0);
    assert_eq!(pipeline.accepted_position().await, None);

    assert!(handle.resume().unwrap());
    eventually("event delivered after resume", || handler.delivered().len() == 1).await;

    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());
    assert_eq!(pipeline.accepted_position().await, Some(position(1)));
}

#[tokio::test]
async fn test_backpressure_pauses_until_buffer_drains() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();
    settings.retry.max_attempts = 10_000;
    settings.backpressure =
        Some(BackpressureThresholds::new(5, 2, Duration::from_millis(10)).unwrap());

    let source = ScriptedSource::new(Vec::new());
    let handler = RecordingHandler::new();
    handler.set_offline(true);
    let pipeline = coordinator(settings, source.clone(), handler.clone(), &stores);
    let handle = pipeline.handle();

    let (shutdown, run) = spawn_pipeline(pipeline);
    eventually("pipeline running", || handle.state() == PipelineState::Running).await;

    for n in 1..=6 {
        source.push(event(n, "orders")).await;
    }
    eventually("backpressure pause", || handle.state() == PipelineState::Paused).await;

    handler.set_offline(false);
    eventually("buffer drained", || handler.delivered().len() == 6).await;
    eventually("backpressure resume", || handle.state() == PipelineState::Running).await;

    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());
}

#[tokio::test]
async fn test_backpressure_never_lifts_manual_pause() {
    let stores = Stores::in_memory();
    let mut settings = fast_settings();
    settings.backpressure =
        Some(BackpressureThresholds::new(5, 2, Duration::from_millis(10)).unwrap());

    let pipeline = coordinator(
        settings,
        ScriptedSource::new(Vec::new()),
        RecordingHandler::new(),
        &stores,
    );
    let handle = pipeline.handle();

    let (shutdown, run) = spawn_pipeline(pipeline);
    eventually("pipeline running", || handle.state() == PipelineState::Running).await;

    handle.pause().unwrap();
    // many controller polls with an empty buffer
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), PipelineState::Paused);

    shutdown.send(true).unwrap();
    assert_ok!(run.await.unwrap());
}
