//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The stable ID of this node, recorded on every batch it seals.
    pub node_id: Uuid,
    /// The port which the metrics & status server is to use.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The maximum number of message summaries to read from storage per page.
    #[serde(default = "Config::default_batch_read_page_size")]
    pub batch_read_page_size: usize,
    /// The maximum amount of time the sequencer will wait for a new message signal before
    /// polling storage again.
    #[serde(default = "Config::default_batch_read_poll_timeout_ms")]
    pub batch_read_poll_timeout_ms: u64,
    /// The minimum amount of time between two polls of storage.
    #[serde(default = "Config::default_batch_minimum_poll_delay_ms")]
    pub batch_minimum_poll_delay_ms: u64,

    /// The default maximum number of messages per batch.
    #[serde(default = "Config::default_batch_size")]
    pub batch_size: usize,
    /// The default maximum estimated payload size of a batch.
    #[serde(default = "Config::default_batch_max_bytes")]
    pub batch_max_bytes: u64,
    /// The default amount of time a batch may accumulate before it is flushed.
    #[serde(default = "Config::default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// The default amount of time a processor may sit idle before it is disposed of.
    #[serde(default = "Config::default_batch_dispose_timeout_ms")]
    pub batch_dispose_timeout_ms: u64,

    /// The first delay used when retrying a failed operation.
    #[serde(default = "Config::default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// The upper bound of the retry delay.
    #[serde(default = "Config::default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// The multiplier applied to the retry delay after each failure.
    #[serde(default = "Config::default_retry_factor")]
    pub retry_factor: f64,

    /// The amount of time a fully resolved message stays in the data cache.
    #[serde(default = "Config::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// The maximum number of messages held by the data cache.
    #[serde(default = "Config::default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the tunables of this config.
    pub fn validate(&self) -> Result<()> {
        if self.batch_read_page_size == 0 {
            return Err(AppError::InvalidInput("BATCH_READ_PAGE_SIZE must be greater than 0".into()).into());
        }
        if self.batch_size == 0 {
            return Err(AppError::InvalidInput("BATCH_SIZE must be greater than 0".into()).into());
        }
        if self.batch_max_bytes == 0 {
            return Err(AppError::InvalidInput("BATCH_MAX_BYTES must be greater than 0".into()).into());
        }
        if self.retry_factor < 1.0 {
            return Err(AppError::InvalidInput(format!("RETRY_FACTOR must be at least 1.0, got {}", self.retry_factor)).into());
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(AppError::InvalidInput("RETRY_INITIAL_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".into()).into());
        }
        Ok(())
    }

    /// The poll timeout of the sequencer.
    pub fn batch_read_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_read_poll_timeout_ms)
    }

    /// The minimum delay between two polls of storage.
    pub fn batch_minimum_poll_delay(&self) -> Duration {
        Duration::from_millis(self.batch_minimum_poll_delay_ms)
    }

    /// The default batch timeout.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// The default processor dispose timeout.
    pub fn batch_dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_dispose_timeout_ms)
    }

    /// The TTL of entries in the data cache.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Build a new retry schedule from this config.
    ///
    /// The schedule never gives up on its own; retry loops are only ever broken by success or
    /// by system shutdown.
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.retry_initial_delay_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_factor,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_batch_read_page_size() -> usize {
        100
    }

    fn default_batch_read_poll_timeout_ms() -> u64 {
        30_000
    }

    fn default_batch_minimum_poll_delay_ms() -> u64 {
        100
    }

    fn default_batch_size() -> usize {
        200
    }

    fn default_batch_max_bytes() -> u64 {
        1024 * 1024
    }

    fn default_batch_timeout_ms() -> u64 {
        1_000
    }

    fn default_batch_dispose_timeout_ms() -> u64 {
        120_000
    }

    fn default_retry_initial_delay_ms() -> u64 {
        250
    }

    fn default_retry_max_delay_ms() -> u64 {
        30_000
    }

    fn default_retry_factor() -> f64 {
        2.0
    }

    fn default_cache_ttl_ms() -> u64 {
        300_000
    }

    fn default_cache_max_entries() -> usize {
        1_000
    }

    /// Build a config suitable for tests, backed by a temporary storage directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            node_id: Uuid::new_v4(),
            metrics_port: 7002,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            batch_read_page_size: 100,
            batch_read_poll_timeout_ms: 500,
            batch_minimum_poll_delay_ms: 0,
            batch_size: 200,
            batch_max_bytes: 1024 * 1024,
            batch_timeout_ms: 50,
            batch_dispose_timeout_ms: 60_000,
            retry_initial_delay_ms: 5,
            retry_max_delay_ms: 50,
            retry_factor: 2.0,
            cache_ttl_ms: 60_000,
            cache_max_entries: 100,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
