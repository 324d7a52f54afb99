//! Storage configuration.
//!
//! All tunables live in [`StorageConfig`]; nothing is read from globals or the
//! environment. Configurations can be built in code or loaded from TOML:
//!
//! ```toml
//! root = "/srv/stowage"
//! sweep_interval = "5m"
//! temp_retention = "1h"
//! upload_concurrency = 8
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::path::{is_valid_filename, MAX_PATH_LENGTH};
use crate::storage::sweeper::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TEMP_RETENTION};
use crate::transaction::recovery::{DEFAULT_MAX_AGE, DEFAULT_MAX_ATTEMPTS};

/// Name of the temp directory under the storage root.
pub const DEFAULT_TEMP_DIR_NAME: &str = ".tmp";

/// Default number of concurrent uploads in a batch.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a storage instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Storage root; created on open if missing.
    pub root: PathBuf,

    /// Temp directory name under the root. Default: `.tmp`.
    #[serde(default = "default_temp_dir_name")]
    pub temp_dir_name: String,

    /// Interval between orphaned temp file sweeps. Default: 5 minutes.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Age after which a temp file is considered orphaned. Default: 1 hour.
    #[serde(default = "default_temp_retention", with = "humantime_serde")]
    pub temp_retention: Duration,

    /// Run the background sweeper. Default: true.
    #[serde(default = "default_true")]
    pub sweeper_enabled: bool,

    /// Retry budget for each failed rollback step. Default: 3.
    #[serde(default = "default_recovery_max_attempts")]
    pub recovery_max_attempts: u32,

    /// Failed rollback steps older than this are dropped. Default: 24 hours.
    #[serde(default = "default_recovery_max_age", with = "humantime_serde")]
    pub recovery_max_age: Duration,

    /// Concurrent uploads in a batch. Default: 4.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Longest accepted virtual path in bytes. Default: 4096.
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
}

fn default_temp_dir_name() -> String {
    DEFAULT_TEMP_DIR_NAME.to_string()
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_temp_retention() -> Duration {
    DEFAULT_TEMP_RETENTION
}

fn default_true() -> bool {
    true
}

fn default_recovery_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_recovery_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_max_path_length() -> usize {
    MAX_PATH_LENGTH
}

impl StorageConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_dir_name: default_temp_dir_name(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            temp_retention: DEFAULT_TEMP_RETENTION,
            sweeper_enabled: true,
            recovery_max_attempts: DEFAULT_MAX_ATTEMPTS,
            recovery_max_age: DEFAULT_MAX_AGE,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            max_path_length: MAX_PATH_LENGTH,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub fn temp_dir_name(mut self, name: impl Into<String>) -> Self {
        self.temp_dir_name = name.into();
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn temp_retention(mut self, retention: Duration) -> Self {
        self.temp_retention = retention;
        self
    }

    #[must_use]
    pub fn sweeper_enabled(mut self, enabled: bool) -> Self {
        self.sweeper_enabled = enabled;
        self
    }

    #[must_use]
    pub fn recovery_max_attempts(mut self, attempts: u32) -> Self {
        self.recovery_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn recovery_max_age(mut self, max_age: Duration) -> Self {
        self.recovery_max_age = max_age;
        self
    }

    #[must_use]
    pub fn upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn max_path_length(mut self, max: usize) -> Self {
        self.max_path_length = max;
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must not be empty".into()));
        }
        is_valid_filename(&self.temp_dir_name)
            .map_err(|e| ConfigError::Invalid(format!("temp_dir_name: {e}")))?;
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be greater than zero".into()));
        }
        if self.recovery_max_attempts == 0 {
            return Err(ConfigError::Invalid("recovery_max_attempts must be at least 1".into()));
        }
        if self.upload_concurrency == 0 {
            return Err(ConfigError::Invalid("upload_concurrency must be at least 1".into()));
        }
        if self.max_path_length == 0 {
            return Err(ConfigError::Invalid("max_path_length must be at least 1".into()));
        }
        Ok(())
    }
}
