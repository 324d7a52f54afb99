//! Bounded-concurrency batch uploads.
//!
//! Every item is uploaded independently through [`StorageService::upload`];
//! one failing item never fails the batch. At most `concurrency` uploads run
//! at once.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::config::StorageConfig;
use crate::metadata::{FileRecord, MetadataStore};
use crate::service::{ServiceError, StorageService};

/// One file to upload.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub path: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

impl UploadItem {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The worker task panicked or was cancelled.
    #[error("upload task failed: {0}")]
    Task(String),
}

/// Result for one item, reported in input order.
#[derive(Debug)]
pub struct UploadOutcome {
    pub path: String,
    pub result: Result<FileRecord, UploadError>,
}

impl UploadOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fans uploads out to a bounded number of tokio tasks.
#[derive(Debug)]
pub struct BatchUploader<M: MetadataStore> {
    service: Arc<StorageService<M>>,
    concurrency: usize,
}

impl<M: MetadataStore> BatchUploader<M> {
    /// `concurrency` is clamped to at least 1.
    pub fn new(service: Arc<StorageService<M>>, concurrency: usize) -> Self {
        Self {
            service,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(service: Arc<StorageService<M>>, config: &StorageConfig) -> Self {
        Self::new(service, config.upload_concurrency)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Upload every item; returns one outcome per item, in input order.
    #[instrument(level = "info", skip_all, fields(items = items.len(), concurrency = self.concurrency))]
    pub async fn upload_all(&self, items: Vec<UploadItem>) -> Vec<UploadOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let paths: Vec<String> = items.iter().map(|item| item.path.clone()).collect();
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let service = Arc::clone(&self.service);
            tasks.spawn(async move {
                // Held for the whole upload; the semaphore is never closed
                let _permit = semaphore.acquire_owned().await;
                let result = service
                    .upload_bytes(&item.path, item.data, item.content_type)
                    .await
                    .map_err(UploadError::from);
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<FileRecord, UploadError>>> =
            std::iter::repeat_with(|| None).take(paths.len()).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Upload task failed"),
            }
        }

        let outcomes: Vec<UploadOutcome> = paths
            .into_iter()
            .zip(results)
            .map(|(path, result)| UploadOutcome {
                path,
                result: result.unwrap_or_else(|| Err(UploadError::Task("task did not complete".into()))),
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        info!(succeeded, failed = outcomes.len() - succeeded, "Batch upload finished");
        outcomes
    }
}
