use anyhow::{anyhow, Result};
use likely_stable::unlikely;
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error_bail;

/// Heuristic of the aggregation cache size of descendant cuboids.
///
/// When a cuboid's cache is not measured, it's derived from the measured cache of the base
/// cuboid: `(constant_factor + variable_factor * rows / base_rows) * base_mb`, never more
/// than the parent's cache and never less than `min_mb`. The defaults are tuned by
/// experience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggrCacheConfig {
    pub constant_factor: f64,
    pub variable_factor: f64,
    pub min_mb: usize,
}

impl Default for AggrCacheConfig {
    fn default() -> Self {
        Self {
            constant_factor: 0.1,
            variable_factor: 0.9,
            min_mb: 10,
        }
    }
}

impl AggrCacheConfig {
    /// Derived cache size in MB of a cuboid with `rows` rows, spanned by a parent whose
    /// cache is `parent_mb`.
    pub fn derive_mb(&self, rows: usize, base_rows: usize, base_mb: usize, parent_mb: usize) -> usize {
        let ratio = if base_rows == 0 {
            0.0
        } else {
            rows as f64 / base_rows as f64
        };

        let mb = ((self.constant_factor + self.variable_factor * ratio) * base_mb as f64).round();

        (mb as usize).min(parent_mb).max(self.min_mb)
    }

    /// Measured cache size in MB, floored at `min_mb`.
    pub fn floor_mb(&self, measured_mb: usize) -> usize {
        measured_mb.max(self.min_mb)
    }
}

/// Configuration of a cube build.
///
/// Every field has a default, so an empty toml string is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubeBuilderConfig {
    /// Number of worker threads running cuboid tasks.
    pub worker_threads: usize,

    /// Memory reserved for the system, not part of the budget.
    pub reserve_memory_mb: usize,

    /// Override the detected available memory of the system.
    pub system_memory_mb: Option<usize>,

    /// Use dogged build if the estimated input rows are above it. `0` means never.
    pub dogged_threshold_rows: u64,

    /// Always use dogged build.
    pub force_dogged: bool,

    /// Max number of input records of one split in dogged build.
    pub split_row_threshold: Option<usize>,

    /// Wait time of one poll of the input queue.
    pub input_poll_timeout_ms: u64,

    /// Capacity of the queue of finished cuboids in dogged build.
    pub output_queue_capacity: usize,

    /// Sleep time between offers to a full output queue.
    pub output_retry_interval_ms: u64,

    /// Give up offering to a full output queue after waiting this long.
    pub output_wait_ceiling_ms: u64,

    /// Sleep time between retries of a memory reservation.
    pub reserve_retry_interval_ms: u64,

    pub aggr_cache: AggrCacheConfig,
}

impl Default for CubeBuilderConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            reserve_memory_mb: 100,
            system_memory_mb: None,
            dogged_threshold_rows: 0,
            force_dogged: false,
            split_row_threshold: None,
            input_poll_timeout_ms: 100,
            output_queue_capacity: 1024,
            output_retry_interval_ms: 5000,
            output_wait_ceiling_ms: 3_600_000,
            reserve_retry_interval_ms: 50,
            aggr_cache: AggrCacheConfig::default(),
        }
    }
}

impl CubeBuilderConfig {
    /// Parse from a toml file.
    pub fn from_config_file(filename: &str) -> Result<Self> {
        let content = std::fs::read_to_string(filename)
            .map_err(|e| anyhow!("failed to read config file {}, error: {}", filename, e))?;

        Self::from_config_str(&content)
    }

    /// Parse from a toml string.
    pub fn from_config_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| anyhow!("invalid cube builder config: {}", e))?;

        config.validate()?;
        info!("cube builder config: {:?}", config);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if unlikely(self.worker_threads == 0) {
            error_bail!("worker_threads must be positive");
        }

        if unlikely(self.output_queue_capacity == 0) {
            error_bail!("output_queue_capacity must be positive");
        }

        if unlikely(self.split_row_threshold == Some(0)) {
            error_bail!("split_row_threshold must be positive");
        }

        if unlikely(self.aggr_cache.constant_factor < 0.0 || self.aggr_cache.variable_factor < 0.0)
        {
            error_bail!(
                "aggr cache factors must not be negative, constant: {}, variable: {}",
                self.aggr_cache.constant_factor,
                self.aggr_cache.variable_factor
            );
        }

        Ok(())
    }

    /// Whether a build of `estimated_rows` input rows should be dogged.
    pub fn use_dogged(&self, estimated_rows: u64) -> bool {
        self.force_dogged
            || (self.dogged_threshold_rows > 0 && estimated_rows > self.dogged_threshold_rows)
    }

    pub fn input_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.input_poll_timeout_ms)
    }

    pub fn output_retry_interval(&self) -> Duration {
        Duration::from_millis(self.output_retry_interval_ms)
    }

    pub fn output_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.output_wait_ceiling_ms)
    }

    pub fn reserve_retry_interval(&self) -> Duration {
        Duration::from_millis(self.reserve_retry_interval_ms)
    }
}
