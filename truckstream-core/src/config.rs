//! Configuration of a pipeline, read from `TRUCKSTREAM_*` environment variables.
use std::{collections::HashMap, time::Duration};

use envconfig::Envconfig;
use thiserror::Error;

use crate::join::UnmatchedPolicy;

/// Full pipeline configuration
#[derive(Envconfig, Debug, Clone)]
pub struct PipelineConfig {
    /// `TRUCKSTREAM_WINDOW_DURATION_MS`, `TRUCKSTREAM_LATENESS_MS`, `TRUCKSTREAM_UNMATCHED_POLICY`
    #[envconfig(nested)]
    pub join: JoinConfig,
    /// `TRUCKSTREAM_SLIDE_LENGTH_MS`, `TRUCKSTREAM_SLIDE_INTERVAL_MS`
    #[envconfig(nested)]
    pub stats: StatsConfig,
    /// Batch sizes and flush ticks of both forwarders, `TRUCKSTREAM_MAX_PENDING`
    #[envconfig(nested)]
    pub forwarders: ForwarderConfig,
    /// Parallelism, channel capacity and poll interval
    #[envconfig(nested)]
    pub runtime: RuntimeConfig,
}

impl PipelineConfig {
    /// Read and validate the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate the configuration from a map of variables.
    /// Variables missing from the map take their defaults.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let config = Self::init_from_hashmap(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("TRUCKSTREAM_WINDOW_DURATION_MS", self.join.window_duration_ms),
            ("TRUCKSTREAM_SLIDE_INTERVAL_MS", self.stats.slide_interval_ms),
            ("TRUCKSTREAM_JOINED_TICK_MS", self.forwarders.joined_tick_ms),
            ("TRUCKSTREAM_STATS_TICK_MS", self.forwarders.stats_tick_ms),
            ("TRUCKSTREAM_POLL_INTERVAL_MS", self.runtime.poll_interval_ms),
        ];
        let counts = [
            ("TRUCKSTREAM_JOINED_BATCH_SIZE", self.forwarders.joined_batch_size),
            ("TRUCKSTREAM_STATS_BATCH_SIZE", self.forwarders.stats_batch_size),
            ("TRUCKSTREAM_DECODE_PARALLELISM", self.runtime.decode_parallelism),
            ("TRUCKSTREAM_JOIN_PARALLELISM", self.runtime.join_parallelism),
            ("TRUCKSTREAM_STATS_PARALLELISM", self.runtime.stats_parallelism),
            ("TRUCKSTREAM_CHANNEL_CAPACITY", self.runtime.channel_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.stats.slide_length_ms <= self.stats.slide_interval_ms {
            return Err(ConfigError::SlideNotShorter {
                length_ms: self.stats.slide_length_ms,
                interval_ms: self.stats.slide_interval_ms,
            });
        }
        Ok(())
    }
}

/// Tumbling window join
#[derive(Envconfig, Debug, Clone)]
pub struct JoinConfig {
    /// Length of a tumbling join window
    #[envconfig(from = "TRUCKSTREAM_WINDOW_DURATION_MS", default = "60000")]
    pub window_duration_ms: u64,
    /// How long a window stays open past its end, defaults to the window duration
    #[envconfig(from = "TRUCKSTREAM_LATENESS_MS")]
    pub lateness_ms: Option<u64>,
    /// `drop` or `emit-partial`
    #[envconfig(from = "TRUCKSTREAM_UNMATCHED_POLICY", default = "drop")]
    pub unmatched_policy: UnmatchedPolicy,
}

impl JoinConfig {
    #[inline]
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    #[inline]
    pub fn lateness(&self) -> Duration {
        Duration::from_millis(self.lateness_ms.unwrap_or(self.window_duration_ms))
    }
}

/// Sliding statistics
#[derive(Envconfig, Debug, Clone)]
pub struct StatsConfig {
    /// How far back a stats record looks
    #[envconfig(from = "TRUCKSTREAM_SLIDE_LENGTH_MS", default = "300000")]
    pub slide_length_ms: u64,
    /// How often stats records are emitted
    #[envconfig(from = "TRUCKSTREAM_SLIDE_INTERVAL_MS", default = "60000")]
    pub slide_interval_ms: u64,
}

impl StatsConfig {
    #[inline]
    pub fn slide_length(&self) -> Duration {
        Duration::from_millis(self.slide_length_ms)
    }

    #[inline]
    pub fn slide_interval(&self) -> Duration {
        Duration::from_millis(self.slide_interval_ms)
    }
}

/// The two batch forwarders
#[derive(Envconfig, Debug, Clone)]
pub struct ForwarderConfig {
    /// Joined records per sink call
    #[envconfig(from = "TRUCKSTREAM_JOINED_BATCH_SIZE", default = "100")]
    pub joined_batch_size: usize,
    /// Flush period for partially filled joined batches
    #[envconfig(from = "TRUCKSTREAM_JOINED_TICK_MS", default = "1000")]
    pub joined_tick_ms: u64,
    /// Stats records per sink call
    #[envconfig(from = "TRUCKSTREAM_STATS_BATCH_SIZE", default = "50")]
    pub stats_batch_size: usize,
    /// Flush period for partially filled stats batches
    #[envconfig(from = "TRUCKSTREAM_STATS_TICK_MS", default = "1000")]
    pub stats_tick_ms: u64,
    /// records buffered while a sink applies backpressure
    #[envconfig(from = "TRUCKSTREAM_MAX_PENDING", default = "1000")]
    pub max_pending: usize,
}

impl ForwarderConfig {
    #[inline]
    pub fn joined_tick(&self) -> Duration {
        Duration::from_millis(self.joined_tick_ms)
    }

    #[inline]
    pub fn stats_tick(&self) -> Duration {
        Duration::from_millis(self.stats_tick_ms)
    }
}

/// Threads and channels
#[derive(Envconfig, Debug, Clone)]
pub struct RuntimeConfig {
    /// Decode workers sharing the input channel
    #[envconfig(from = "TRUCKSTREAM_DECODE_PARALLELISM", default = "2")]
    pub decode_parallelism: usize,
    /// Join partitions, each owning a share of the correlation keys
    #[envconfig(from = "TRUCKSTREAM_JOIN_PARALLELISM", default = "2")]
    pub join_parallelism: usize,
    /// Stats partitions, each owning a share of the drivers
    #[envconfig(from = "TRUCKSTREAM_STATS_PARALLELISM", default = "1")]
    pub stats_parallelism: usize,
    /// max messages in flight between two stages
    #[envconfig(from = "TRUCKSTREAM_CHANNEL_CAPACITY", default = "1024")]
    pub channel_capacity: usize,
    /// how often idle stages check the clock
    #[envconfig(from = "TRUCKSTREAM_POLL_INTERVAL_MS", default = "50")]
    pub poll_interval_ms: u64,
}

impl RuntimeConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is present but does not parse
    #[error("Failed to read configuration")]
    Env(#[from] envconfig::Error),
    /// Names the variable that was zero
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("Slide length {length_ms}ms must be longer than the slide interval {interval_ms}ms")]
    SlideNotShorter { length_ms: u64, interval_ms: u64 },
}
