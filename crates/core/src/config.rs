//! Client configuration.
//!
//! ```toml
//! endpoint = "https://collector.example.com/v1/batches"
//! spool_dir = "/var/lib/mygame/telemetry"
//! max_batch_size = 50
//! max_batch_delay = "10s"
//! max_retries = 5
//! spool_compaction_threshold = 1048576
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::{Result, TelemetryError};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1/batches";

pub fn default_spool_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("telespool")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Collector URL that receives batches via POST
    pub endpoint: String,

    /// Directory holding the spool journal
    pub spool_dir: PathBuf,

    /// Records per batch
    /// Default: 50
    pub max_batch_size: usize,

    /// Longest a record waits in memory before its batch is cut
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub max_batch_delay: Duration,

    /// In-memory records before the oldest batch is force-flushed
    /// Default: 1000
    pub queue_capacity: usize,

    /// Re-sends of one batch before it is left for the next cycle
    /// Default: 5
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Batches delivered concurrently
    /// Default: 2
    pub max_in_flight: usize,

    /// Journal size in bytes that triggers compaction
    /// Default: 1 MiB
    pub spool_compaction_threshold: u64,

    /// Bound on the final flush performed by shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            spool_dir: default_spool_dir(),
            max_batch_size: 50,
            max_batch_delay: Duration::from_secs(10),
            queue_capacity: 1000,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_in_flight: 2,
            spool_compaction_threshold: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TelemetryError::Config("endpoint must not be empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(TelemetryError::Config("max_batch_size must be > 0".into()));
        }
        if self.queue_capacity < self.max_batch_size {
            return Err(TelemetryError::Config(format!(
                "queue_capacity ({}) must be >= max_batch_size ({})",
                self.queue_capacity, self.max_batch_size
            )));
        }
        if self.max_in_flight == 0 {
            return Err(TelemetryError::Config("max_in_flight must be > 0".into()));
        }
        if self.max_batch_delay.is_zero() {
            return Err(TelemetryError::Config("max_batch_delay must be > 0".into()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(TelemetryError::Config(
                "retry_base_delay must not exceed retry_max_delay".into(),
            ));
        }
        Ok(())
    }
}
