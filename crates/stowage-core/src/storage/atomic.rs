//! Atomic, lock-protected filesystem primitives.
//!
//! # Write Protocol
//!
//! Every mutation of file content goes through the same steps:
//!
//! 1. Acquire the exclusive lock for the target path
//! 2. Create the target's parent directories
//! 3. Stream the content into a uniquely named file in the temp directory,
//!    then flush and fsync it
//! 4. Rename the temp file onto the target
//!
//! The rename is the atomicity boundary: readers observe either the complete
//! old content or the complete new content. On any failure the temp file is
//! removed before the error is returned.
//!
//! # Paths
//!
//! Paths passed to [`AtomicStorage`] are system paths that already went
//! through [`PathValidator::validate_and_get_full_path`]. This type does not
//! re-validate them; it does render them root-relative in errors and logs.
//!
//! [`PathValidator::validate_and_get_full_path`]: crate::path::PathValidator::validate_and_get_full_path

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, instrument, trace};

use super::locks::{LockMode, LockRegistry};
use super::sweeper::SweeperHandle;
use super::temp::TempFile;
use super::{StorageContext, StorageError};
use crate::config::StorageConfig;
use crate::path::display_relative;

/// Permission bits applied to new files when the caller has no preference.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Snapshot of storage state for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Paths currently holding or awaiting a lock
    pub active_locks: usize,
    /// Directory holding in-flight temp files
    pub temp_dir: PathBuf,
}

/// Crash-safe file storage rooted at a single directory.
///
/// `AtomicStorage` is `Send + Sync`; share it with `Arc` across tasks. All
/// concurrency control is internal.
///
/// ```ignore
/// let storage = AtomicStorage::open(&StorageConfig::new("/srv/stowage")).await?;
/// storage.write_file(&full_path, b"hello", DEFAULT_FILE_MODE).await?;
/// let bytes = storage.read_file(&full_path).await?;
/// storage.close().await?;
/// ```
#[derive(Debug)]
pub struct AtomicStorage {
    root: PathBuf,
    temp_dir: PathBuf,
    locks: Arc<LockRegistry>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl AtomicStorage {
    /// Open (creating if needed) the storage root and its temp directory, and
    /// start the background sweeper unless the configuration disables it.
    ///
    /// The configuration is validated first; an unusable one fails with
    /// [`StorageError::Config`] before anything is created on disk.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(level = "info", skip(config), fields(root = %config.root.display()))]
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let setup_ctx = || StorageContext::new().with_operation("open").with_path("/");

        fs::create_dir_all(&config.root)
            .await
            .map_err(|source| StorageError::CreateDirectory {
                source,
                context: setup_ctx(),
            })?;
        let root = fs::canonicalize(&config.root)
            .await
            .map_err(|source| StorageError::Io {
                source,
                context: setup_ctx(),
            })?;

        let temp_dir = root.join(&config.temp_dir_name);
        fs::create_dir_all(&temp_dir)
            .await
            .map_err(|source| StorageError::CreateDirectory {
                source,
                context: setup_ctx(),
            })?;

        let sweeper = config.sweeper_enabled.then(|| {
            SweeperHandle::spawn(temp_dir.clone(), config.sweep_interval, config.temp_retention)
        });

        info!(sweeper = config.sweeper_enabled, "Storage opened");
        Ok(Self {
            root,
            temp_dir,
            locks: Arc::new(LockRegistry::new()),
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Root-relative rendering of `path` for logs and errors.
    pub fn display(&self, path: &Path) -> String {
        display_relative(&self.root, path)
    }

    fn ctx(&self, operation: &'static str, path: &Path) -> StorageContext {
        StorageContext::new()
            .with_operation(operation)
            .with_path(self.display(path))
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    // ==================== Writes ====================

    /// Atomically replace the content of `path` with `data`.
    #[instrument(level = "debug", skip(self, data), fields(path = %self.display(path), len = data.len()))]
    pub async fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<(), StorageError> {
        let mut reader = data;
        self.write_file_stream(path, &mut reader, mode).await.map(|_| ())
    }

    /// Atomically replace the content of `path` with everything read from
    /// `reader`, without buffering it in memory. Returns the bytes written.
    #[instrument(level = "debug", skip(self, reader), fields(path = %self.display(path)))]
    pub async fn write_file_stream<R>(&self, path: &Path, reader: &mut R, mode: u32) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let _guard = self.locks.write(&Self::key(path)).await;
        trace!("Acquired write lock");
        self.write_locked(path, reader, mode).await
    }

    /// Temp-then-rename write. The caller holds the exclusive lock on `path`.
    async fn write_locked<R>(&self, path: &Path, reader: &mut R, mode: u32) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::CreateDirectory {
                    source,
                    context: self.ctx("write", path),
                })?;
        }
        // Recreate the temp directory if an operator removed it
        fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|source| StorageError::CreateDirectory {
                source,
                context: self.ctx("write", path),
            })?;

        let temp = TempFile::new_in(&self.temp_dir, path);
        let written = match fill_temp_file(temp.path(), reader, mode).await {
            Ok(n) => n,
            Err(source) => {
                temp.discard().await;
                return Err(StorageError::TempFile {
                    source,
                    context: self.ctx("write", path),
                });
            }
        };

        if let Err(source) = fs::rename(temp.path(), path).await {
            temp.discard().await;
            return Err(StorageError::Rename {
                source,
                context: self.ctx("write", path),
            });
        }
        temp.persisted();

        debug!(bytes = written, "File written atomically");
        Ok(written)
    }

    /// Move `source` to `target`.
    ///
    /// Both locks are taken in lexicographic order of the paths, whichever is
    /// the source, so two crossed moves cannot deadlock. If several tasks race
    /// to move the same source, exactly one succeeds and the others get
    /// [`StorageError::SourceNotFound`]. An existing file at `target` is
    /// replaced.
    #[instrument(level = "debug", skip(self), fields(source = %self.display(source), target = %self.display(target)))]
    pub async fn move_file(&self, source: &Path, target: &Path) -> Result<(), StorageError> {
        let (src_key, dst_key) = (Self::key(source), Self::key(target));
        let _guards = self.locks.write_ordered(&[src_key.as_str(), dst_key.as_str()]).await;
        trace!("Acquired ordered write locks");

        self.require_source(source, "move").await?;
        if source == target {
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source_err| StorageError::CreateDirectory {
                    source: source_err,
                    context: self.ctx("move", target),
                })?;
        }

        fs::rename(source, target).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::SourceNotFound {
                    context: self.ctx("move", source),
                }
            } else {
                StorageError::Rename {
                    source: e,
                    context: self.ctx("move", target),
                }
            }
        })?;

        debug!("File moved");
        Ok(())
    }

    /// Copy `source` to `target` through the atomic write protocol.
    ///
    /// The source is locked shared and the target exclusive, both in the
    /// global lexicographic order.
    #[instrument(level = "debug", skip(self), fields(source = %self.display(source), target = %self.display(target)))]
    pub async fn copy_file(&self, source: &Path, target: &Path) -> Result<u64, StorageError> {
        let (src_key, dst_key) = (Self::key(source), Self::key(target));
        let _guards = self
            .locks
            .lock_ordered(&[(src_key.as_str(), LockMode::Shared), (dst_key.as_str(), LockMode::Exclusive)])
            .await;

        self.require_source(source, "copy").await?;
        if source == target {
            let len = fs::metadata(source).await.map_or(0, |m| m.len());
            return Ok(len);
        }

        let mut file = File::open(source).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::SourceNotFound {
                    context: self.ctx("copy", source),
                }
            } else {
                StorageError::Io {
                    source: e,
                    context: self.ctx("copy", source),
                }
            }
        })?;
        let mode = source_mode(&file).await;
        self.write_locked(target, &mut file, mode).await
    }

    /// Delete `path`. A missing path is success; directories are removed
    /// recursively.
    #[instrument(level = "debug", skip(self), fields(path = %self.display(path)))]
    pub async fn delete_file(&self, path: &Path) -> Result<(), StorageError> {
        let _guard = self.locks.write(&Self::key(path)).await;

        let metadata = match fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("Already absent");
                return Ok(());
            }
            Err(source) => {
                return Err(StorageError::Io {
                    source,
                    context: self.ctx("delete", path),
                });
            }
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => {
                debug!(is_dir = metadata.is_dir(), "Deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                source,
                context: self.ctx("delete", path),
            }),
        }
    }

    /// Create `path` and any missing parents as directories.
    #[instrument(level = "debug", skip(self), fields(path = %self.display(path)))]
    pub async fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        let _guard = self.locks.write(&Self::key(path)).await;
        fs::create_dir_all(path)
            .await
            .map_err(|source| StorageError::CreateDirectory {
                source,
                context: self.ctx("create_dir", path),
            })
    }

    // ==================== Reads ====================

    /// Read the whole file under a shared lock.
    #[instrument(level = "debug", skip(self), fields(path = %self.display(path)))]
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        let _guard = self.locks.read(&Self::key(path)).await;
        fs::read(path).await.map_err(|e| self.read_error(e, path))
    }

    /// Open the file for streaming reads.
    ///
    /// The shared lock is held only while opening; the returned handle keeps
    /// reading the inode it opened even if a writer renames new content over
    /// the path afterwards.
    #[instrument(level = "debug", skip(self), fields(path = %self.display(path)))]
    pub async fn open_file(&self, path: &Path) -> Result<File, StorageError> {
        let _guard = self.locks.read(&Self::key(path)).await;
        File::open(path).await.map_err(|e| self.read_error(e, path))
    }

    /// Whether anything exists at `path`.
    pub async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let _guard = self.locks.read(&Self::key(path)).await;
        fs::try_exists(path).await.map_err(|source| StorageError::Io {
            source,
            context: self.ctx("exists", path),
        })
    }

    fn read_error(&self, e: io::Error, path: &Path) -> StorageError {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound {
                context: self.ctx("read", path),
            }
        } else {
            StorageError::Io {
                source: e,
                context: self.ctx("read", path),
            }
        }
    }

    async fn require_source(&self, source: &Path, operation: &'static str) -> Result<(), StorageError> {
        match fs::symlink_metadata(source).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::SourceNotFound {
                context: self.ctx(operation, source),
            }),
            Err(e) => Err(StorageError::Io {
                source: e,
                context: self.ctx(operation, source),
            }),
        }
    }

    // ==================== Lifecycle ====================

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            active_locks: self.locks.active_count(),
            temp_dir: self.temp_dir.clone(),
        }
    }

    /// Stop the sweeper after one final sweep. Calling it again is a no-op.
    #[instrument(level = "info", skip(self))]
    pub async fn close(&self) -> Result<(), StorageError> {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await?;
            info!("Storage closed");
        }
        Ok(())
    }
}

async fn fill_temp_file<R>(temp_path: &Path, reader: &mut R, mode: u32) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    apply_mode(temp_path, mode).await?;
    Ok(written)
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn source_mode(file: &File) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    file.metadata()
        .await
        .map_or(DEFAULT_FILE_MODE, |m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
async fn source_mode(_file: &File) -> u32 {
    DEFAULT_FILE_MODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_storage() -> (TempDir, AtomicStorage) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path().join("root")).sweeper_enabled(false);
        let storage = AtomicStorage::open(&config).await.unwrap();
        (dir, storage)
    }

    fn temp_entries(storage: &AtomicStorage) -> usize {
        std::fs::read_dir(storage.temp_dir()).unwrap().count()
    }

    #[tokio::test]
    async fn test_open_creates_root_and_temp_dir() {
        let (_dir, storage) = open_storage().await;
        assert!(storage.root().is_dir());
        assert!(storage.temp_dir().is_dir());
        assert_eq!(storage.temp_dir(), storage.root().join(".tmp"));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let config = StorageConfig::new(&root).sweep_interval(std::time::Duration::ZERO);

        let err = AtomicStorage::open(&config).await.unwrap_err();

        assert!(matches!(err, StorageError::Config(_)), "{err:?}");
        assert!(err.to_string().contains("sweep_interval"));
        assert!(!root.exists(), "nothing is created for a rejected config");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("docs/nested/a.txt");

        storage.write_file(&path, b"hello", DEFAULT_FILE_MODE).await.unwrap();

        assert_eq!(storage.read_file(&path).await.unwrap(), b"hello");
        assert_eq!(temp_entries(&storage), 0, "temp file must be renamed away");
        assert_eq!(storage.stats().active_locks, 0);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("a.txt");

        storage.write_file(&path, b"first version, longer", DEFAULT_FILE_MODE).await.unwrap();
        storage.write_file(&path, b"second", DEFAULT_FILE_MODE).await.unwrap();

        assert_eq!(storage.read_file(&path).await.unwrap(), b"second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("private.txt");
        storage.write_file(&path, b"x", 0o600).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_temp_file() {
        let (_dir, storage) = open_storage().await;
        // Target is an existing directory, so the final rename fails
        let path = storage.root().join("occupied");
        std::fs::create_dir_all(path.join("child")).unwrap();

        let err = storage.write_file(&path, b"data", DEFAULT_FILE_MODE).await.unwrap_err();

        assert!(matches!(err, StorageError::Rename { .. }), "got {err:?}");
        assert_eq!(temp_entries(&storage), 0);
        assert_eq!(storage.stats().active_locks, 0);
    }

    #[tokio::test]
    async fn test_error_message_hides_root() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("missing.txt");

        let err = storage.read_file(&path).await.unwrap_err();

        assert!(matches!(err, StorageError::NotFound { .. }));
        let message = err.to_string();
        assert!(message.contains("/missing.txt"));
        assert!(!message.contains(&*storage.root().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_stream_write_counts_bytes() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("big.bin");
        let payload = vec![7u8; 256 * 1024];

        let mut reader = payload.as_slice();
        let written = storage
            .write_file_stream(&path, &mut reader, DEFAULT_FILE_MODE)
            .await
            .unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(storage.read_file(&path).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_move_file() {
        let (_dir, storage) = open_storage().await;
        let src = storage.root().join("a.txt");
        let dst = storage.root().join("sub/b.txt");
        storage.write_file(&src, b"moving", DEFAULT_FILE_MODE).await.unwrap();

        storage.move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(storage.read_file(&dst).await.unwrap(), b"moving");
    }

    #[tokio::test]
    async fn test_move_missing_source() {
        let (_dir, storage) = open_storage().await;
        let err = storage
            .move_file(&storage.root().join("ghost"), &storage.root().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SourceNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_move_onto_itself_is_noop() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("same.txt");
        storage.write_file(&path, b"x", DEFAULT_FILE_MODE).await.unwrap();

        storage.move_file(&path, &path).await.unwrap();
        assert_eq!(storage.read_file(&path).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_copy_file() {
        let (_dir, storage) = open_storage().await;
        let src = storage.root().join("orig.txt");
        let dst = storage.root().join("copies/copy.txt");
        storage.write_file(&src, b"duplicate me", DEFAULT_FILE_MODE).await.unwrap();

        let copied = storage.copy_file(&src, &dst).await.unwrap();

        assert_eq!(copied, 12);
        assert_eq!(storage.read_file(&src).await.unwrap(), b"duplicate me");
        assert_eq!(storage.read_file(&dst).await.unwrap(), b"duplicate me");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("gone.txt");

        storage.delete_file(&path).await.unwrap();
        storage.write_file(&path, b"x", DEFAULT_FILE_MODE).await.unwrap();
        storage.delete_file(&path).await.unwrap();
        storage.delete_file(&path).await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_directory_recursively() {
        let (_dir, storage) = open_storage().await;
        let dir = storage.root().join("tree");
        storage.write_file(&dir.join("a/b/c.txt"), b"x", DEFAULT_FILE_MODE).await.unwrap();

        storage.delete_file(&dir).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_open_file_and_exists() {
        use tokio::io::AsyncReadExt;

        let (_dir, storage) = open_storage().await;
        let path = storage.root().join("stream.txt");
        assert!(!storage.exists(&path).await.unwrap());
        storage.write_file(&path, b"streamed", DEFAULT_FILE_MODE).await.unwrap();
        assert!(storage.exists(&path).await.unwrap());

        let mut file = storage.open_file(&path).await.unwrap();
        assert_eq!(storage.stats().active_locks, 0, "lock is released after open");

        let mut buf = String::new();
        file.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "streamed");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = AtomicStorage::open(&StorageConfig::new(dir.path())).await.unwrap();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
    }
}
