//! Crash-safe, concurrency-safe filesystem primitives.
//!
//! - [`AtomicStorage`]: write/read/move/delete built on temp-file-then-rename
//!   and per-path locking
//! - [`LockRegistry`]: the reference-counted per-path lock table
//! - [`sweeper`]: background removal of orphaned temp files

pub mod atomic;
pub mod locks;
pub mod sweeper;
mod temp;

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

pub use atomic::{AtomicStorage, StorageStats, DEFAULT_FILE_MODE};
pub use locks::{LockMode, LockRegistry, PathGuard, PathReadGuard, PathWriteGuard};
pub use sweeper::{sweep_temp_dir, SweepReport};
pub use temp::TEMP_SUFFIX;
pub(crate) use temp::temp_file_name;

/// Context attached to storage errors.
///
/// Paths are stored root-relative (`/a/b.txt`) so messages never reveal the
/// absolute location of the storage root.
#[derive(Debug, Clone, Default)]
pub struct StorageContext {
    /// Operation being performed
    pub operation: Option<&'static str>,
    /// Root-relative path of the target
    pub path: Option<String>,
}

impl StorageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl std::fmt::Display for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();

        if let Some(op) = self.operation {
            parts.push(op.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at '{path}'"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors returned by [`AtomicStorage`].
#[derive(Error, Debug)]
pub enum StorageError {
    /// Move/copy source vanished before the operation could lock it.
    #[error("source does not exist: {context}")]
    SourceNotFound { context: StorageContext },

    #[error("not found: {context}")]
    NotFound { context: StorageContext },

    #[error("failed to create directory for {context}: {source}")]
    CreateDirectory {
        #[source]
        source: io::Error,
        context: StorageContext,
    },

    #[error("failed to write temp file for {context}: {source}")]
    TempFile {
        #[source]
        source: io::Error,
        context: StorageContext,
    },

    #[error("failed to rename into place for {context}: {source}")]
    Rename {
        #[source]
        source: io::Error,
        context: StorageContext,
    },

    #[error("IO error during {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: StorageContext,
    },

    #[error("background sweeper task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid storage configuration: {0}")]
    Config(#[from] ConfigError),
}

impl StorageError {
    /// Whether the error means the target (or move source) does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::SourceNotFound { .. } | StorageError::NotFound { .. } => true,
            StorageError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn context(&self) -> Option<&StorageContext> {
        match self {
            StorageError::SourceNotFound { context }
            | StorageError::NotFound { context }
            | StorageError::CreateDirectory { context, .. }
            | StorageError::TempFile { context, .. }
            | StorageError::Rename { context, .. }
            | StorageError::Io { context, .. } => Some(context),
            StorageError::Join(_) | StorageError::Config(_) => None,
        }
    }
}
