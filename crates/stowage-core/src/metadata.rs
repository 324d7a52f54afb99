//! Metadata store interface.
//!
//! The storage service keeps one [`FileRecord`] per stored file. The store is
//! abstract so the same transactional pairing works against a database, a
//! remote index or the bundled [`InMemoryMetadataStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::path::ValidatedPath;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("no record for '{path}'")]
    NotFound { path: String },

    #[error("record already exists for '{path}'")]
    AlreadyExists { path: String },

    /// Failure inside the store implementation.
    #[error("metadata backend error: {message}")]
    Backend { message: String },
}

/// Metadata about one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: ValidatedPath,
    pub size: u64,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(path: ValidatedPath, size: u64, content_type: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            path,
            size,
            content_type,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or("")
    }

    /// Same record at a new location.
    #[must_use]
    pub fn relocated(&self, path: ValidatedPath) -> Self {
        Self {
            path,
            modified_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Persistent index of file records, keyed by virtual path.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Add a record. Fails with [`MetadataError::AlreadyExists`] if the path
    /// is taken.
    async fn insert(&self, record: FileRecord) -> Result<(), MetadataError>;

    async fn lookup(&self, path: &ValidatedPath) -> Result<Option<FileRecord>, MetadataError>;

    /// Change a record's name within its directory.
    async fn rename(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError>;

    /// Move a record to another directory.
    async fn move_to(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError>;

    async fn delete(&self, path: &ValidatedPath) -> Result<(), MetadataError>;

    /// Records directly inside `dir`, ordered by path.
    async fn list(&self, dir: &ValidatedPath) -> Result<Vec<FileRecord>, MetadataError>;
}

/// [`MetadataStore`] backed by an in-process ordered map.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<BTreeMap<ValidatedPath, FileRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn relocate(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError> {
        let mut records = self.records.write();
        if path == new_path {
            return if records.contains_key(path) {
                Ok(())
            } else {
                Err(MetadataError::NotFound { path: path.to_string() })
            };
        }
        if records.contains_key(new_path) {
            return Err(MetadataError::AlreadyExists {
                path: new_path.to_string(),
            });
        }
        let record = records
            .remove(path)
            .ok_or_else(|| MetadataError::NotFound { path: path.to_string() })?;
        records.insert(new_path.clone(), record.relocated(new_path.clone()));
        trace!(from = %path, to = %new_path, "Record relocated");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert(&self, record: FileRecord) -> Result<(), MetadataError> {
        let mut records = self.records.write();
        if records.contains_key(&record.path) {
            return Err(MetadataError::AlreadyExists {
                path: record.path.to_string(),
            });
        }
        records.insert(record.path.clone(), record);
        Ok(())
    }

    async fn lookup(&self, path: &ValidatedPath) -> Result<Option<FileRecord>, MetadataError> {
        Ok(self.records.read().get(path).cloned())
    }

    async fn rename(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError> {
        self.relocate(path, new_path)
    }

    async fn move_to(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError> {
        self.relocate(path, new_path)
    }

    async fn delete(&self, path: &ValidatedPath) -> Result<(), MetadataError> {
        self.records
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound { path: path.to_string() })
    }

    async fn list(&self, dir: &ValidatedPath) -> Result<Vec<FileRecord>, MetadataError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| record.path.parent().as_ref() == Some(dir))
            .cloned()
            .collect())
    }
}
