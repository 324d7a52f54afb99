//! Error types for the stowage-core crate
//!
//! Each component owns its error enum; this module gathers them, along with
//! their context structures, in one place.

pub use crate::config::ConfigError;
pub use crate::metadata::MetadataError;
pub use crate::path::PathError;
pub use crate::service::ServiceError;
pub use crate::storage::{StorageContext, StorageError};
pub use crate::transaction::{BoxError, RollbackFailure, TransactionError};
pub use crate::upload::UploadError;
