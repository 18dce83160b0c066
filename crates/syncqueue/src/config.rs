//! Configuration management for syncqueue.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::item::DEFAULT_MAX_RETRIES;
use crate::queue::{QueueSettings, RetrySchedule, DEFAULT_STORAGE_KEY, MAX_QUEUE_SIZE};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "syncqueue";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "queue.db";

/// Default remote documents directory name.
const DOCUMENTS_DIR_NAME: &str = "documents";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SYNCQUEUE_`)
/// 2. TOML config file at `~/.config/syncqueue/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue behavior.
    pub queue: QueueConfig,
    /// Local storage configuration.
    pub storage: StorageConfig,
    /// Remote document store configuration.
    pub remote: RemoteConfig,
}

/// Queue-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending items; the oldest are evicted beyond this.
    pub max_queue_size: usize,
    /// Retry budget for items enqueued without an explicit one.
    pub default_max_retries: u32,
    /// Delay before each retry, in milliseconds. The last entry repeats.
    pub retry_intervals_ms: Vec<u64>,
    /// Key the serialized queue is stored under.
    pub storage_key: String,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/syncqueue/queue.db`
    pub database_path: Option<PathBuf>,
}

/// Remote document store configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Directory holding remote documents.
    /// Defaults to `~/.local/share/syncqueue/documents`
    pub documents_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: MAX_QUEUE_SIZE,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_intervals_ms: RetrySchedule::default().intervals_ms(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("SYNCQUEUE_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue;

        if queue.max_queue_size == 0 {
            return Err(invalid("max_queue_size must be greater than 0"));
        }

        if queue.default_max_retries == 0 {
            return Err(invalid("default_max_retries must be greater than 0"));
        }

        if queue.retry_intervals_ms.is_empty() {
            return Err(invalid("retry_intervals_ms must not be empty"));
        }

        if queue.retry_intervals_ms.contains(&0) {
            return Err(invalid("retry_intervals_ms entries must be greater than 0"));
        }

        if queue.retry_intervals_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid(format!(
                "retry_intervals_ms must be non-decreasing, got {:?}",
                queue.retry_intervals_ms
            )));
        }

        if queue.storage_key.trim().is_empty() {
            return Err(invalid("storage_key must not be empty"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the remote documents directory, resolving defaults if not set.
    #[must_use]
    pub fn documents_dir(&self) -> PathBuf {
        self.remote
            .documents_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DOCUMENTS_DIR_NAME))
    }

    /// Get the retry delays as Durations.
    #[must_use]
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.queue
            .retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Build the runtime settings for a [`crate::DurableQueue`].
    #[must_use]
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_queue_size: self.queue.max_queue_size,
            default_max_retries: self.queue.default_max_retries,
            retry_schedule: RetrySchedule::new(self.retry_intervals()),
            storage_key: self.queue.storage_key.clone(),
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
