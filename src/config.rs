//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Restart policy knobs: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Maximum restart attempts before the session is failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff growth factor applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Health probing thresholds.
///
/// The probe timeout must be strictly shorter than the probe interval so
/// a slow probe can never overlap the next one.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Seconds between liveness probes.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
    /// Seconds to wait for a probe response before counting a miss.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Consecutive misses before the session is declared unresponsive.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

fn default_probe_interval() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_miss_threshold() -> u32 {
    2
}

/// Diagram repair loop bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RepairConfig {
    /// Maximum correction cycles per diagram block.
    #[serde(default = "default_cycle_limit")]
    pub cycle_limit: u32,
    /// Seconds to wait for the worker to produce a corrected document.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_seconds: u64,
    /// Optional external renderer command used to validate diagram source.
    #[serde(default)]
    pub validator_cmd: Option<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            cycle_limit: default_cycle_limit(),
            response_timeout_seconds: default_response_timeout(),
            validator_cmd: None,
        }
    }
}

fn default_cycle_limit() -> u32 {
    3
}

fn default_response_timeout() -> u64 {
    300
}

/// Durable session store location.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoreConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".deepdive/sessions.db")
}

/// Worker process launch settings for the process-backed adapter.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Agent CLI binary (e.g., `claude`).
    #[serde(default)]
    pub cli: String,
    /// Default arguments for the agent CLI.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Restart policy bounds.
    #[serde(default)]
    pub restart: RestartConfig,
    /// Health probing thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Diagram repair bounds.
    #[serde(default)]
    pub repair: RepairConfig,
    /// Session store location.
    #[serde(default)]
    pub store: StoreConfig,
    /// Worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Probe interval as a [`Duration`].
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.health.probe_interval_seconds)
    }

    /// Probe timeout as a [`Duration`].
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.restart.max_attempts == 0 {
            return Err(AppError::Config(
                "restart.max_attempts must be greater than zero".into(),
            ));
        }
        if self.restart.multiplier == 0 {
            return Err(AppError::Config(
                "restart.multiplier must be greater than zero".into(),
            ));
        }
        if self.health.probe_timeout_seconds >= self.health.probe_interval_seconds {
            return Err(AppError::Config(
                "health.probe_timeout_seconds must be strictly shorter than probe_interval_seconds"
                    .into(),
            ));
        }
        if self.health.miss_threshold == 0 {
            return Err(AppError::Config(
                "health.miss_threshold must be greater than zero".into(),
            ));
        }
        if self.repair.cycle_limit == 0 {
            return Err(AppError::Config(
                "repair.cycle_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
