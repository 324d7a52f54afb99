pub mod cat;
pub mod check;
pub mod cp;
pub mod mkdir;
pub mod mv;
pub mod put;
pub mod rm;
pub mod stats;
pub mod sweep;

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use stowage_core::path::{PathError, is_valid_filename};
use stowage_core::{AtomicStorage, PathValidator, StorageConfig};

/// An opened storage root plus the validator every command resolves paths with.
pub struct Context {
    pub config: StorageConfig,
    pub storage: AtomicStorage,
    pub validator: PathValidator,
}

impl Context {
    pub async fn open(config: StorageConfig) -> Result<Self> {
        let storage = AtomicStorage::open(&config)
            .await
            .with_context(|| format!("Failed to open storage at {}", config.root.display()))?;
        let validator = PathValidator::new(storage.root())
            .with_max_length(config.max_path_length)
            .with_reserved_dir(config.temp_dir_name.clone());
        Ok(Self {
            config,
            storage,
            validator,
        })
    }

    /// System path for any virtual path, the root included. Paths inside the
    /// temp directory are refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.validator.validate_and_get_full_path(path)?)
    }

    /// System path for a virtual path that names a new entry.
    ///
    /// The final segment must be a valid filename, which also rules out the root.
    pub fn resolve_entry(&self, path: &str) -> Result<PathBuf> {
        let validated = self.validator.validate_and_normalize_path(path)?;
        let name = validated.file_name().ok_or(PathError::InvalidPath)?;
        is_valid_filename(name)?;
        Ok(self.validator.full_path(&validated)?)
    }
}
