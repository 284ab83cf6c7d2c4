pub mod runtime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Token refresh scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between sweeps
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Refresh tokens expiring within this many seconds
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    /// Backoff table for failed refreshes; its length is the retry budget
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
    /// Notified when a connection's refresh permanently fails
    #[serde(default)]
    pub failure_webhook_url: Option<String>,
}

/// Upper bound for any scheduler interval, threshold or retry delay.
pub const MAX_SCHEDULER_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn default_check_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    300
}

fn default_retry_delays() -> Vec<u64> {
    vec![1_000, 2_000, 5_000, 10_000, 30_000]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
            retry_delays_ms: default_retry_delays(),
            failure_webhook_url: None,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs).min(MAX_SCHEDULER_DURATION)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs).min(MAX_SCHEDULER_DURATION)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms).min(MAX_SCHEDULER_DURATION))
            .collect()
    }
}

/// API executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Total attempts per call for retryable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Cap on a single backoff delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Longest platform-reported rate-limit wait the executor sleeps through
    #[serde(default = "default_max_rate_limit_wait")]
    pub max_rate_limit_wait_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_rate_limit_wait() -> u64 {
    60_000
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_rate_limit_wait_ms: default_max_rate_limit_wait(),
        }
    }
}

impl AdapterConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.max_rate_limit_wait_ms)
    }
}

/// Error registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// External error tracking endpoint (optional)
    #[serde(default)]
    pub tracking_endpoint: Option<String>,
}

fn default_history_size() -> usize {
    crate::error::DEFAULT_HISTORY_SIZE
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            tracking_endpoint: None,
        }
    }
}

/// Connection store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "connections.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
