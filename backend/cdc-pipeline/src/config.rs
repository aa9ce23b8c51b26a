//! Layered pipeline configuration
//!
//! Loading order (later wins):
//! 1. `config/defaults.toml` compiled into the binary
//! 2. The TOML file named by `PIPELINE_CONFIG`, if set
//! 3. `LAKESYNC__SECTION__KEY` environment variables
//! 4. `DATABASE_URL`, if set

use crate::backpressure::BackpressureThresholds;
use crate::error::{ConfigError, PipelineResult};
use resilience::RetryPolicy;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use validator::Validate;

const DEFAULTS: &str = include_str!("../config/defaults.toml");
const ENV_PREFIX: &str = "LAKESYNC";

/// Where the checkpoint, buffer and dead-letter stores live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PipelineConfig {
    #[validate(nested)]
    pub service: ServiceSettings,
    #[validate(nested)]
    pub database: DatabaseSettings,
    #[validate(nested)]
    pub source: SourceSettings,
    pub sink: SinkSettings,
    #[validate(nested)]
    pub checkpoint: CheckpointSettings,
    #[validate(nested)]
    pub buffer: BufferSettings,
    #[validate(nested)]
    pub batch: BatchSettings,
    #[validate(nested)]
    pub retry: RetrySettings,
    pub dlq: DlqSettings,
    #[validate(nested)]
    pub backpressure: BackpressureSettings,
    #[validate(nested)]
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServiceSettings {
    #[validate(length(min = 1))]
    pub name: String,
    /// Key for checkpoints, buffer rows and dead letters
    #[validate(length(min = 1, max = 255))]
    pub source_id: String,
    pub storage: StorageBackend,
    #[validate(range(min = 1))]
    pub shutdown_grace_period_secs: u64,
    /// Upper bound on events written to the buffer in one transaction
    #[validate(range(min = 1, max = 10000))]
    pub ingest_batch_size: usize,
}

#[derive(Clone, Deserialize, Validate)]
pub struct DatabaseSettings {
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
    pub min_connections: u32,
    #[validate(range(min = 1))]
    pub acquire_timeout_secs: u64,
}

// Connection string carries credentials
impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &redact_url(&self.url))
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SourceSettings {
    pub path: PathBuf,
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSettings {
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckpointSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BufferSettings {
    /// `false` keeps the buffer in process memory; nothing survives a restart.
    pub enabled: bool,
    pub retention_secs: u64,
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatchSettings {
    #[validate(range(min = 1, max = 100000))]
    pub size: usize,
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,
    #[validate(range(min = 1))]
    pub handler_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetrySettings {
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    #[validate(range(min = 1))]
    pub initial_interval_ms: u64,
    #[validate(range(min = 1))]
    pub max_interval_ms: u64,
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DlqSettings {
    pub enabled: bool,
    /// 0 keeps entries until they are deleted by hand
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BackpressureSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub high_watermark: u64,
    pub low_watermark: u64,
    #[validate(range(min = 1))]
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HealthSettings {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub listen_address: String,
    #[validate(range(min = 1))]
    pub check_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub check_interval_secs: u64,
    #[validate(range(min = 1))]
    pub max_buffer_lag_secs: u64,
    pub dlq_warn_threshold: u64,
}

impl PipelineConfig {
    /// Load from defaults, `PIPELINE_CONFIG`, and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml));

        if let Ok(path) = std::env::var("PIPELINE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with an inline TOML document. Ignores the environment.
    pub fn from_toml(overrides: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = config::Config::builder()
            .add_source(config::File::from_str(DEFAULTS, config::FileFormat::Toml))
            .add_source(config::File::from_str(overrides, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Field ranges plus the cross-field rules derive cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;

        if self.backpressure.low_watermark >= self.backpressure.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "backpressure.low_watermark ({}) must be below backpressure.high_watermark ({})",
                self.backpressure.low_watermark, self.backpressure.high_watermark
            )));
        }

        if self.retry.max_interval_ms < self.retry.initial_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_interval_ms ({}) must be at least retry.initial_interval_ms ({})",
                self.retry.max_interval_ms, self.retry.initial_interval_ms
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid(
                "database.min_connections exceeds database.max_connections".to_string(),
            ));
        }

        if !self.buffer.enabled
            && self.checkpoint.enabled
            && self.service.storage == StorageBackend::Postgres
        {
            return Err(ConfigError::Invalid(
                "checkpoint.enabled requires buffer.enabled with postgres storage; \
                 a durable checkpoint would skip events lost from the in-memory buffer"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn backpressure_thresholds(&self) -> PipelineResult<BackpressureThresholds> {
        BackpressureThresholds::new(
            self.backpressure.high_watermark,
            self.backpressure.low_watermark,
            Duration::from_millis(self.backpressure.check_interval_ms),
        )
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_grace_period_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint.interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch.flush_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.batch.handler_timeout_secs)
    }

    pub fn buffer_retention(&self) -> Duration {
        Duration::from_secs(self.buffer.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.cleanup_interval_secs)
    }

    /// `None` when dead letters never expire
    pub fn dlq_retention(&self) -> Option<Duration> {
        match self.dlq.retention_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn log_summary(&self) {
        info!(
            source_id = %self.service.source_id,
            storage = ?self.service.storage,
            database = %redact_url(&self.database.url),
            batch_size = self.batch.size,
            checkpoint_enabled = self.checkpoint.enabled,
            dlq_enabled = self.dlq.enabled,
            backpressure_enabled = self.backpressure.enabled,
            high_watermark = self.backpressure.high_watermark,
            low_watermark = self.backpressure.low_watermark,
            "Pipeline configuration loaded"
        );
    }
}

/// Replace the password component of a connection URL with `***`.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}://{}:***@{}",
            &url[..scheme_end],
            &credentials[..colon],
            &rest[at + 1..]
        ),
        None => url.to_string(),
    }
}
