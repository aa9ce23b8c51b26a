use anyhow::{Context, Result};
use cdc_pipeline::config::{PipelineConfig, StorageBackend};
use cdc_pipeline::coordinator::{PipelineComponents, PipelineCoordinator, PipelineSettings};
use cdc_pipeline::handler::JsonLinesSink;
use cdc_pipeline::health::{BufferLagCheck, DeadLetterCheck, PipelineStateCheck};
use cdc_pipeline::metrics::PipelineMetrics;
use cdc_pipeline::source::JsonLinesSource;
use cdc_pipeline::stores::Stores;
use health_registry::{HealthRegistry, HealthRegistryBuilder};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_pipeline=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = PipelineConfig::load().context("Failed to load configuration")?;
    info!(service = %config.service.name, "Starting CDC pipeline");
    config.log_summary();

    let source_id = config.service.source_id.clone();

    let pool = match config.service.storage {
        StorageBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .min_connections(config.database.min_connections)
                .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
                .connect(&config.database.url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            info!("Database pool created successfully");

            info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            info!("Migrations completed successfully");
            Some(pool)
        }
        StorageBackend::Memory => {
            warn!("In-memory storage selected; checkpoints, buffer and dead letters do not survive a restart");
            None
        }
    };

    let mut stores = match &pool {
        Some(pool) => Stores::postgres(pool.clone()),
        None => Stores::in_memory(),
    };
    if !config.buffer.enabled {
        warn!("Event buffer disabled; staged events and checkpoints are kept in memory only");
        stores = stores.with_volatile_buffer();
    }

    let source = Arc::new(JsonLinesSource::new(
        source_id.clone(),
        config.source.path.clone(),
        Duration::from_millis(config.source.poll_interval_ms),
        config.source.channel_capacity,
    ));
    let handler = Arc::new(JsonLinesSink::new(config.sink.output_dir.clone()));
    let metrics = PipelineMetrics::new(&source_id);
    let settings = PipelineSettings::from_config(&config).context("Invalid pipeline settings")?;

    let coordinator = PipelineCoordinator::new(
        settings,
        PipelineComponents {
            source,
            handler,
            buffer: stores.buffer.clone(),
            checkpoints: stores.checkpoints.clone(),
            dead_letters: stores.dead_letters.clone(),
        },
        metrics,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = if config.health.enabled {
        let mut builder = HealthRegistryBuilder::new()
            .with_check_timeout(Duration::from_millis(config.health.check_timeout_ms))
            .with_check(Arc::new(PipelineStateCheck::new(coordinator.handle())))
            .with_check(Arc::new(BufferLagCheck::new(
                source_id.clone(),
                stores.buffer.clone(),
                Duration::from_secs(config.health.max_buffer_lag_secs),
            )))
            .with_check(Arc::new(DeadLetterCheck::new(
                stores.dead_letters.clone(),
                config.health.dlq_warn_threshold,
            )));
        if let Some(pool) = &pool {
            builder = builder.with_postgres(pool.clone());
        }
        let registry = Arc::new(builder.build().await);

        let checker = HealthRegistry::start_background_check(
            registry.clone(),
            Duration::from_secs(config.health.check_interval_secs),
            shutdown_rx.clone(),
        );
        let server = cdc_pipeline::http::serve(&config.health.listen_address, registry)
            .context("Failed to bind health server")?;
        let server_handle = server.handle();
        actix_rt::spawn(server);
        Some((server_handle, checker))
    } else {
        None
    };

    let run = coordinator.run(shutdown_rx);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some((server_handle, checker)) = health {
        server_handle.stop(true).await;
        let _ = checker.await;
    }

    match result {
        Ok(()) => {
            info!("CDC pipeline shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "CDC pipeline terminated with an error");
            Err(e).context("Pipeline failed")
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
