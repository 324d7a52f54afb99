//! Transactional, concurrency-safe file storage.
//!
//! - [`path`]: validation of caller-supplied paths and filenames
//! - [`storage`]: atomic write/move/delete primitives with per-path locking
//!   and orphaned temp file sweeping
//! - [`transaction`]: multi-step operations with compensating rollback and
//!   recovery of failed undo steps
//! - [`service`] / [`upload`]: filesystem plus metadata-store operations built
//!   on the above

pub mod config;
pub mod error;
pub mod metadata;
pub mod path;
pub mod service;
pub mod storage;
pub mod transaction;
pub mod upload;

pub use config::StorageConfig;
pub use metadata::{FileRecord, InMemoryMetadataStore, MetadataStore};
pub use path::{PathValidator, ValidatedPath};
pub use service::StorageService;
pub use storage::{AtomicStorage, DEFAULT_FILE_MODE};
pub use transaction::{Operation, RecoveryManager, TransactionManager};
pub use upload::{BatchUploader, UploadItem, UploadOutcome};
