//! Engine configuration.
//!
//! Loaded from a TOML file when one is given, otherwise defaults apply.
//! Every field has a serde default so partial files work.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration for workers, queue, reconciler, and logging.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker-loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Transient-failure retries before a ticket fails permanently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between heartbeat updates while a ticket is held
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeats older than this mark a processing ticket stale
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Watchdog budget for a single step execution
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

/// In-memory queue knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Unacked deliveries are redelivered after this many seconds
    #[serde(default = "default_in_flight_timeout_secs")]
    pub in_flight_timeout_secs: u64,
    /// Redeliveries of one message before it is dead-lettered
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
    /// Delay before a nacked message becomes consumable again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Reconciler sweep knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between sweeps for stale processing tickets
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; stderr only when unset
    #[serde(default)]
    pub file: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_threshold_secs() -> u64 {
    300
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_in_flight_timeout_secs() -> u64 {
    30
}

fn default_max_redeliveries() -> u32 {
    6
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            in_flight_timeout_secs: default_in_flight_timeout_secs(),
            max_redeliveries: default_max_redeliveries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or defaults if `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl QueueConfig {
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.in_flight_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ReconcilerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
