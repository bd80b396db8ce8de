//! Synchronization configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.savesync.toml`)
//! 2. Environment variables (with `SAVESYNC_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [sync.save_queue]
//! max_chunk_size = 10
//! pool_size = 10
//!
//! [sync.load_queue]
//! max_chunk_size = 5
//! pool_size = 4
//!
//! [sync.transfer]
//! busy_policy = "wait"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONFIG_FILE, DEFAULT_POOL_SIZE, ENV_PREFIX, MAX_REQUEST_AMOUNT,
    MAX_TASK_POOL,
};

/// Top-level configuration for a [`SyncContext`](crate::context::SyncContext).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Chunking and pool settings for the save queue.
    pub save_queue: QueueConfig,

    /// Chunking and pool settings for the load queue.
    pub load_queue: QueueConfig,

    /// Transfer boundary settings.
    pub transfer: TransferConfig,
}

impl SyncConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML configuration file
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content.
    ///
    /// Values are read from the `[sync]` table; a missing table yields the
    /// defaults. The result is not validated.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            sync: SyncConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(full.sync)
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Recognised keys: `SAVESYNC_SAVE_CHUNK_SIZE`, `SAVESYNC_SAVE_POOL_SIZE`,
    /// `SAVESYNC_LOAD_CHUNK_SIZE`, `SAVESYNC_LOAD_POOL_SIZE` and
    /// `SAVESYNC_BUSY_POLICY`. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(v) = read("SAVE_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.save_queue.max_chunk_size = v;
        }
        if let Some(v) = read("SAVE_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.save_queue.pool_size = v;
        }
        if let Some(v) = read("LOAD_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.load_queue.max_chunk_size = v;
        }
        if let Some(v) = read("LOAD_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.load_queue.pool_size = v;
        }
        if let Some(v) = read("BUSY_POLICY").and_then(|v| v.parse().ok()) {
            self.transfer.busy_policy = v;
        }
    }

    /// Checks every queue setting against the remote and pool limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.save_queue.validate("save_queue")?;
        self.load_queue.validate("load_queue")
    }
}

/// Chunking and pool settings for one queue.
///
/// # Defaults
///
/// | Setting          | Default | Bound                       |
/// |------------------|---------|-----------------------------|
/// | `max_chunk_size` | 10      | `1..=MAX_REQUEST_AMOUNT`    |
/// | `pool_size`      | 10      | `1..=MAX_TASK_POOL`         |
///
/// # Examples
///
/// ```
/// use saveable_sync::config::QueueConfig;
///
/// let config = QueueConfig::default()
///     .with_max_chunk_size(3)
///     .with_pool_size(4);
/// assert_eq!(config.max_chunk_size, 3);
/// assert!(config.validate("save").is_ok());
///
/// assert!(QueueConfig::default().with_max_chunk_size(11).validate("save").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of items sent in one batch request.
    pub max_chunk_size: usize,

    /// Number of reusable task slots.
    pub pool_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl QueueConfig {
    /// Sets the maximum chunk size.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Sets the number of task slots.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Validates this queue's limits; `section` names it in the error.
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !(1..=MAX_REQUEST_AMOUNT).contains(&self.max_chunk_size) {
            return Err(ConfigError::OutOfRange {
                field: format!("{section}.max_chunk_size"),
                value: self.max_chunk_size,
                max: MAX_REQUEST_AMOUNT,
            });
        }
        if !(1..=MAX_TASK_POOL).contains(&self.pool_size) {
            return Err(ConfigError::OutOfRange {
                field: format!("{section}.pool_size"),
                value: self.pool_size,
                max: MAX_TASK_POOL,
            });
        }
        Ok(())
    }
}

/// Transfer boundary settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// What the boundary does with a call while another is in flight.
    pub busy_policy: BusyPolicy,
}

impl TransferConfig {
    /// Sets the busy policy.
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }
}

/// Behaviour of the transfer boundary when a call arrives while it is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Reject the call immediately; the caller retries on a later tick.
    #[default]
    Reject,
    /// Accept the call and wait for the in-flight call to finish.
    Wait,
}

impl std::str::FromStr for BusyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "wait" => Ok(Self::Wait),
            other => Err(ConfigError::Parse(format!("unknown busy policy: {other}"))),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading configuration file.
    #[error("failed to read config file {path}: {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// Parse error in configuration.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A numeric setting is outside its allowed range.
    #[error("{field} = {value} is out of range (1..={max})")]
    OutOfRange {
        /// Dotted path of the setting.
        field: String,
        /// The configured value.
        value: usize,
        /// The inclusive upper bound.
        max: usize,
    },
}
