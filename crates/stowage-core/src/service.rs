//! File operations that keep the filesystem and the metadata store in step.
//!
//! Each mutating call validates its inputs, then runs a transaction that
//! pairs the physical change with the matching metadata change. If either
//! half fails, the other is undone; undo steps that fail are parked in the
//! service's [`RecoveryManager`].
//!
//! | Call        | Step 1                          | Step 2                 |
//! |-------------|---------------------------------|------------------------|
//! | `upload`    | write file                      | insert record          |
//! | `rename`    | move file                       | rename record          |
//! | `move_to`   | move file                       | move record            |
//! | `delete`    | delete record                   | stage file in temp dir |
//!
//! Calls on the same virtual path are serialized by a service-level lock
//! table, taken before any storage lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument, warn};

use crate::config::StorageConfig;
use crate::metadata::{FileRecord, MetadataError, MetadataStore};
use crate::path::{is_valid_filename, PathError, PathValidator, ValidatedPath};
use crate::storage::{temp_file_name, AtomicStorage, LockRegistry, StorageError, DEFAULT_FILE_MODE};
use crate::transaction::{BoxError, Operation, RecoveryManager, TransactionError, TransactionManager};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("'{path}' already exists")]
    AlreadyExists { path: String },

    #[error("'{path}' not found")]
    NotFound { path: String },
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ServiceError::NotFound { .. } | ServiceError::Metadata(MetadataError::NotFound { .. }) => true,
            ServiceError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Whether the caller's input was refused before anything was changed.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            ServiceError::Path(_)
                | ServiceError::Storage(StorageError::Config(_))
                | ServiceError::AlreadyExists { .. }
                | ServiceError::Metadata(MetadataError::AlreadyExists { .. })
        )
    }
}

/// Transactional file service over [`AtomicStorage`] and a [`MetadataStore`].
#[derive(Debug)]
pub struct StorageService<M: MetadataStore> {
    storage: Arc<AtomicStorage>,
    metadata: Arc<M>,
    validator: PathValidator,
    recovery: Arc<RecoveryManager>,
    /// Keyed by virtual path; always taken before storage locks
    path_locks: Arc<LockRegistry>,
}

impl<M: MetadataStore> StorageService<M> {
    pub fn new(storage: Arc<AtomicStorage>, metadata: Arc<M>, config: &StorageConfig) -> Self {
        let validator = PathValidator::new(storage.root())
            .with_max_length(config.max_path_length)
            .with_reserved_dir(config.temp_dir_name.clone());
        Self {
            storage,
            metadata,
            validator,
            recovery: Arc::new(RecoveryManager::from_config(config)),
            path_locks: Arc::new(LockRegistry::new()),
        }
    }

    /// Open storage for `config` and build a service on top of it.
    pub async fn open(config: &StorageConfig, metadata: Arc<M>) -> Result<Self, ServiceError> {
        let storage = Arc::new(AtomicStorage::open(config).await?);
        Ok(Self::new(storage, metadata, config))
    }

    pub fn storage(&self) -> &Arc<AtomicStorage> {
        &self.storage
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    /// Failed rollback steps awaiting retry.
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    fn transaction(&self) -> TransactionManager {
        TransactionManager::new().with_recovery(Arc::clone(&self.recovery))
    }

    /// Validate a path that must name a file (not the root, valid final
    /// segment).
    fn validate_file_path(&self, path: &str) -> Result<(ValidatedPath, PathBuf), ServiceError> {
        let validated = self.validator.validate_and_normalize_path(path)?;
        let name = validated.file_name().ok_or(PathError::InvalidPath)?;
        is_valid_filename(name)?;
        let full = self.validator.full_path(&validated)?;
        Ok((validated, full))
    }

    async fn require_record(&self, path: &ValidatedPath) -> Result<FileRecord, ServiceError> {
        self.metadata
            .lookup(path)
            .await?
            .ok_or_else(|| ServiceError::NotFound { path: path.to_string() })
    }

    /// Neither a record nor an unrecorded file may sit at `path`.
    async fn require_vacant(&self, path: &ValidatedPath, full: &Path) -> Result<(), ServiceError> {
        let recorded = self.metadata.lookup(path).await?.is_some();
        if recorded || self.storage.exists(full).await? {
            return Err(ServiceError::AlreadyExists { path: path.to_string() });
        }
        Ok(())
    }

    /// `name` inside `dir`, run back through the validator so the result
    /// obeys the same length and reserved-directory rules as caller input.
    fn child_path(&self, dir: &ValidatedPath, name: &str) -> Result<ValidatedPath, ServiceError> {
        let joined = dir.join(name)?;
        Ok(self.validator.validate_and_normalize_path(joined.as_str())?)
    }

    /// Store the content of `reader` at `path` and record it.
    ///
    /// Fails with [`ServiceError::AlreadyExists`] if a record or a file
    /// already exists at `path`. The reader is consumed by the write step.
    #[instrument(level = "info", skip(self, reader), fields(path = %path))]
    pub async fn upload<R>(
        &self,
        path: &str,
        reader: R,
        content_type: Option<String>,
    ) -> Result<FileRecord, ServiceError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (validated, full) = self.validate_file_path(path)?;
        let _lock = self.path_locks.write(validated.as_str()).await;
        self.require_vacant(&validated, &full).await?;

        let body = Arc::new(Mutex::new(Some(reader)));
        let written = Arc::new(AtomicU64::new(0));
        let inserted: Arc<Mutex<Option<FileRecord>>> = Arc::new(Mutex::new(None));

        let mut tx = self.transaction();
        tx.add_operation(write_file_op(&self.storage, full, body, Arc::clone(&written), &validated))?;
        tx.add_operation(insert_record_op(
            &self.metadata,
            validated.clone(),
            content_type,
            written,
            Arc::clone(&inserted),
        ))?;
        tx.execute().await?;

        let record = inserted
            .lock()
            .take()
            .ok_or_else(|| ServiceError::NotFound { path: validated.to_string() })?;
        info!(size = record.size, "Uploaded");
        Ok(record)
    }

    /// [`upload`](Self::upload) from an in-memory buffer.
    pub async fn upload_bytes(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<FileRecord, ServiceError> {
        self.upload(path, std::io::Cursor::new(data), content_type).await
    }

    /// Look up a file's record and open its content for reading.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn download(&self, path: &str) -> Result<(FileRecord, File), ServiceError> {
        let (validated, full) = self.validate_file_path(path)?;
        let _lock = self.path_locks.read(validated.as_str()).await;
        let record = self.require_record(&validated).await?;
        let file = self.storage.open_file(&full).await?;
        Ok((record, file))
    }

    /// Record for `path`, if any.
    pub async fn info(&self, path: &str) -> Result<Option<FileRecord>, ServiceError> {
        let validated = self.validator.validate_and_normalize_path(path)?;
        Ok(self.metadata.lookup(&validated).await?)
    }

    /// Give a file a new name in the same directory.
    #[instrument(level = "info", skip(self), fields(path = %path, new_name = %new_name))]
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<FileRecord, ServiceError> {
        let (validated, full) = self.validate_file_path(path)?;
        let parent = validated.parent().ok_or(PathError::InvalidPath)?;
        let new_path = self.child_path(&parent, new_name)?;
        self.relocate(validated, full, new_path, RelocateKind::Rename).await
    }

    /// Move a file into `target_dir`, keeping its name.
    #[instrument(level = "info", skip(self), fields(path = %path, target_dir = %target_dir))]
    pub async fn move_to(&self, path: &str, target_dir: &str) -> Result<FileRecord, ServiceError> {
        let (validated, full) = self.validate_file_path(path)?;
        let dir = self.validator.validate_and_normalize_path(target_dir)?;
        for segment in dir.segments() {
            is_valid_filename(segment)?;
        }
        let name = validated.file_name().ok_or(PathError::InvalidPath)?;
        let new_path = self.child_path(&dir, name)?;
        self.relocate(validated, full, new_path, RelocateKind::Move).await
    }

    async fn relocate(
        &self,
        path: ValidatedPath,
        full: PathBuf,
        new_path: ValidatedPath,
        kind: RelocateKind,
    ) -> Result<FileRecord, ServiceError> {
        let _locks = self
            .path_locks
            .write_ordered(&[path.as_str(), new_path.as_str()])
            .await;

        let record = self.require_record(&path).await?;
        if path == new_path {
            return Ok(record);
        }
        let new_full = self.validator.full_path(&new_path)?;
        self.require_vacant(&new_path, &new_full).await?;

        let mut tx = self.transaction();
        tx.add_operation(move_file_op(
            &self.storage,
            full,
            new_full,
            format!("move file {path} -> {new_path}"),
        ))?;
        tx.add_operation(relocate_record_op(&self.metadata, path.clone(), new_path.clone(), kind))?;
        tx.execute().await?;

        debug!(from = %path, to = %new_path, "Relocated");
        Ok(record.relocated(new_path))
    }

    /// Remove a file and its record.
    ///
    /// The file is first moved into the temp directory, then removed after
    /// the transaction commits. If that final removal fails the sweeper
    /// reclaims it later.
    #[instrument(level = "info", skip(self), fields(path = %path))]
    pub async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        let (validated, full) = self.validate_file_path(path)?;
        let _lock = self.path_locks.write(validated.as_str()).await;
        let record = self.require_record(&validated).await?;

        let staged = self.storage.temp_dir().join(temp_file_name(&full));
        let was_staged = Arc::new(AtomicBool::new(false));

        let mut tx = self.transaction();
        tx.add_operation(delete_record_op(&self.metadata, record))?;
        tx.add_operation(stage_file_op(&self.storage, full, staged.clone(), Arc::clone(&was_staged)))?;
        tx.execute().await?;

        if was_staged.load(Ordering::SeqCst)
            && let Err(e) = self.storage.delete_file(&staged).await
        {
            warn!(error = %e, "Failed to remove staged file, leaving it for the sweeper");
        }
        info!("Deleted");
        Ok(())
    }

    /// Create a directory (and missing parents).
    pub async fn create_folder(&self, path: &str) -> Result<ValidatedPath, ServiceError> {
        let validated = self.validator.validate_and_normalize_path(path)?;
        for segment in validated.segments() {
            is_valid_filename(segment)?;
        }
        let full = self.validator.full_path(&validated)?;
        self.storage.create_dir(&full).await?;
        Ok(validated)
    }

    /// Records directly inside `dir`.
    pub async fn list(&self, dir: &str) -> Result<Vec<FileRecord>, ServiceError> {
        let validated = self.validator.validate_and_normalize_path(dir)?;
        Ok(self.metadata.list(&validated).await?)
    }
}

#[derive(Debug, Clone, Copy)]
enum RelocateKind {
    Rename,
    Move,
}

fn write_file_op<R>(
    storage: &Arc<AtomicStorage>,
    full: PathBuf,
    body: Arc<Mutex<Option<R>>>,
    written: Arc<AtomicU64>,
    path: &ValidatedPath,
) -> Operation
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let exec_storage = Arc::clone(storage);
    let exec_full = full.clone();
    let undo_storage = Arc::clone(storage);
    Operation::new(
        format!("write file {path}"),
        move || {
            let storage = Arc::clone(&exec_storage);
            let full = exec_full.clone();
            let body = Arc::clone(&body);
            let written = Arc::clone(&written);
            async move {
                let mut reader = body.lock().take().ok_or("upload body already consumed")?;
                let n = storage.write_file_stream(&full, &mut reader, DEFAULT_FILE_MODE).await?;
                written.store(n, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        },
        move || {
            let storage = Arc::clone(&undo_storage);
            let full = full.clone();
            async move { storage.delete_file(&full).await.map_err(BoxError::from) }
        },
    )
}

fn insert_record_op<M: MetadataStore>(
    metadata: &Arc<M>,
    path: ValidatedPath,
    content_type: Option<String>,
    written: Arc<AtomicU64>,
    inserted: Arc<Mutex<Option<FileRecord>>>,
) -> Operation {
    let exec_store = Arc::clone(metadata);
    let exec_path = path.clone();
    let undo_store = Arc::clone(metadata);
    Operation::new(
        format!("insert record {path}"),
        move || {
            let store = Arc::clone(&exec_store);
            let record = FileRecord::new(exec_path.clone(), written.load(Ordering::SeqCst), content_type.clone());
            let inserted = Arc::clone(&inserted);
            async move {
                store.insert(record.clone()).await?;
                *inserted.lock() = Some(record);
                Ok::<(), BoxError>(())
            }
        },
        move || {
            let store = Arc::clone(&undo_store);
            let path = path.clone();
            async move { store.delete(&path).await.map_err(BoxError::from) }
        },
    )
}

fn move_file_op(storage: &Arc<AtomicStorage>, from: PathBuf, to: PathBuf, description: String) -> Operation {
    let exec = (Arc::clone(storage), from.clone(), to.clone());
    let undo = (Arc::clone(storage), from, to);
    Operation::new(
        description,
        move || {
            let (storage, from, to) = (Arc::clone(&exec.0), exec.1.clone(), exec.2.clone());
            async move { storage.move_file(&from, &to).await.map_err(BoxError::from) }
        },
        move || {
            let (storage, from, to) = (Arc::clone(&undo.0), undo.1.clone(), undo.2.clone());
            async move { storage.move_file(&to, &from).await.map_err(BoxError::from) }
        },
    )
}

fn relocate_record_op<M: MetadataStore>(
    metadata: &Arc<M>,
    from: ValidatedPath,
    to: ValidatedPath,
    kind: RelocateKind,
) -> Operation {
    let description = match kind {
        RelocateKind::Rename => format!("rename record {from} -> {to}"),
        RelocateKind::Move => format!("move record {from} -> {to}"),
    };
    let exec = (Arc::clone(metadata), from.clone(), to.clone());
    let undo = (Arc::clone(metadata), from, to);
    Operation::new(
        description,
        move || {
            let (store, from, to) = (Arc::clone(&exec.0), exec.1.clone(), exec.2.clone());
            async move { relocate_record(&*store, &from, &to, kind).await }
        },
        move || {
            let (store, from, to) = (Arc::clone(&undo.0), undo.1.clone(), undo.2.clone());
            async move { relocate_record(&*store, &to, &from, kind).await }
        },
    )
}

async fn relocate_record<M: MetadataStore>(
    store: &M,
    from: &ValidatedPath,
    to: &ValidatedPath,
    kind: RelocateKind,
) -> Result<(), BoxError> {
    match kind {
        RelocateKind::Rename => store.rename(from, to).await?,
        RelocateKind::Move => store.move_to(from, to).await?,
    }
    Ok(())
}

fn delete_record_op<M: MetadataStore>(metadata: &Arc<M>, record: FileRecord) -> Operation {
    let exec_store = Arc::clone(metadata);
    let exec_path = record.path.clone();
    let undo_store = Arc::clone(metadata);
    Operation::new(
        format!("delete record {}", record.path),
        move || {
            let store = Arc::clone(&exec_store);
            let path = exec_path.clone();
            async move { store.delete(&path).await.map_err(BoxError::from) }
        },
        move || {
            let store = Arc::clone(&undo_store);
            let record = record.clone();
            async move { store.insert(record).await.map_err(BoxError::from) }
        },
    )
}

/// Move the file into the temp directory. A file that is already gone is
/// nothing to stage.
fn stage_file_op(
    storage: &Arc<AtomicStorage>,
    full: PathBuf,
    staged: PathBuf,
    was_staged: Arc<AtomicBool>,
) -> Operation {
    let description = format!("stage file {}", storage.display(&full));
    let exec = (Arc::clone(storage), full.clone(), staged.clone(), Arc::clone(&was_staged));
    let undo = (Arc::clone(storage), full, staged, was_staged);
    Operation::new(
        description,
        move || {
            let (storage, full, staged, flag) =
                (Arc::clone(&exec.0), exec.1.clone(), exec.2.clone(), Arc::clone(&exec.3));
            async move {
                match storage.move_file(&full, &staged).await {
                    Ok(()) => {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    Err(StorageError::SourceNotFound { .. }) => {
                        warn!(path = %storage.display(&full), "Record had no file on disk");
                        Ok(())
                    }
                    Err(e) => Err(BoxError::from(e)),
                }
            }
        },
        move || {
            let (storage, full, staged, flag) =
                (Arc::clone(&undo.0), undo.1.clone(), undo.2.clone(), Arc::clone(&undo.3));
            async move {
                if flag.load(Ordering::SeqCst) {
                    storage.move_file(&staged, &full).await?;
                    flag.store(false, Ordering::SeqCst);
                }
                Ok::<(), BoxError>(())
            }
        },
    )
}
