#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use stowage_core::metadata::{FileRecord, InMemoryMetadataStore, MetadataError, MetadataStore};
use stowage_core::{AtomicStorage, PathValidator, StorageConfig, StorageService, ValidatedPath};
use tempfile::TempDir;

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Storage rooted in a fresh temp directory, sweeper off unless configured.
pub struct TestStorage {
    pub dir: TempDir,
    pub storage: Arc<AtomicStorage>,
    pub validator: PathValidator,
}

impl TestStorage {
    pub async fn open() -> Self {
        Self::with_config(|config| config).await
    }

    pub async fn with_config(customize: impl FnOnce(StorageConfig) -> StorageConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = customize(StorageConfig::new(dir.path().join("store")).sweeper_enabled(false));
        let storage = AtomicStorage::open(&config).await.expect("Failed to open storage");
        let validator = PathValidator::new(storage.root());
        Self {
            dir,
            storage: Arc::new(storage),
            validator,
        }
    }

    /// System path for a virtual path.
    pub fn full(&self, path: &str) -> PathBuf {
        self.validator
            .validate_and_get_full_path(path)
            .expect("test path should be valid")
    }

    pub fn temp_entries(&self) -> usize {
        std::fs::read_dir(self.storage.temp_dir())
            .expect("temp dir should exist")
            .count()
    }
}

/// `len`-byte payload that starts with a tag identifying its writer.
pub fn tagged_payload(tag: usize, len: usize) -> Vec<u8> {
    let mut payload = format!("writer-{tag:03}:").into_bytes();
    let fill = b'a' + (tag % 26) as u8;
    payload.resize(len, fill);
    payload
}

/// Metadata store whose writes can be made to fail on demand, one switch per
/// kind of write.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryMetadataStore,
    pub fail_insert: AtomicBool,
    pub fail_relocate: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FlakyStore {
    fn check(switch: &AtomicBool, what: &str) -> Result<(), MetadataError> {
        if switch.load(Ordering::SeqCst) {
            return Err(MetadataError::Backend {
                message: format!("injected {what} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn insert(&self, record: FileRecord) -> Result<(), MetadataError> {
        Self::check(&self.fail_insert, "insert")?;
        self.inner.insert(record).await
    }

    async fn lookup(&self, path: &ValidatedPath) -> Result<Option<FileRecord>, MetadataError> {
        self.inner.lookup(path).await
    }

    async fn rename(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError> {
        Self::check(&self.fail_relocate, "rename")?;
        self.inner.rename(path, new_path).await
    }

    async fn move_to(&self, path: &ValidatedPath, new_path: &ValidatedPath) -> Result<(), MetadataError> {
        Self::check(&self.fail_relocate, "move")?;
        self.inner.move_to(path, new_path).await
    }

    async fn delete(&self, path: &ValidatedPath) -> Result<(), MetadataError> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(path).await
    }

    async fn list(&self, dir: &ValidatedPath) -> Result<Vec<FileRecord>, MetadataError> {
        self.inner.list(dir).await
    }
}

/// Swap the temp directory for a plain file so nothing can be staged in it.
pub fn block_temp_dir(temp_dir: &Path) {
    std::fs::remove_dir_all(temp_dir).expect("Failed to remove temp dir");
    std::fs::write(temp_dir, b"in the way").expect("Failed to block temp dir");
}

/// Undo [`block_temp_dir`].
pub fn unblock_temp_dir(temp_dir: &Path) {
    std::fs::remove_file(temp_dir).expect("Failed to unblock temp dir");
    std::fs::create_dir(temp_dir).expect("Failed to recreate temp dir");
}

/// Service over a [`FlakyStore`] in a fresh temp directory.
pub async fn open_service() -> (TempDir, Arc<StorageService<FlakyStore>>) {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = StorageConfig::new(dir.path().join("store")).sweeper_enabled(false);
    let service = StorageService::open(&config, Arc::new(FlakyStore::default()))
        .await
        .expect("Failed to open service");
    (dir, Arc::new(service))
}
