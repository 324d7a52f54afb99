//! Bounded retry of rollback steps that failed.
//!
//! When a transaction cannot undo one of its executed operations, the
//! operation is parked here instead of being forgotten. An operator (or a
//! periodic job) calls [`RecoveryManager::retry_pending`] to attempt the
//! undo again. Each entry is retried at most `max_attempts` times; after
//! that it is marked non-recoverable and kept for inspection until it
//! expires after `max_age`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::Operation;
use crate::config::StorageConfig;

/// Default number of retry attempts per failed undo step.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default age after which a failed entry is dropped.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A rollback step that could not be completed.
#[derive(Debug)]
pub struct FailedOperation {
    /// The operation whose rollback step failed
    pub operation: Operation,
    /// Most recent failure message
    pub error: String,
    /// When the first failure happened
    pub failed_at: DateTime<Utc>,
    /// Retries attempted so far
    pub attempts: u32,
    /// False once the retry budget is exhausted
    pub recoverable: bool,
}

impl FailedOperation {
    fn new(operation: Operation, error: String) -> Self {
        Self {
            operation,
            error,
            failed_at: Utc::now(),
            attempts: 0,
            recoverable: true,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.failed_at)
    }
}

/// Read-only view of a parked entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecovery {
    pub description: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub recoverable: bool,
}

/// Outcome of one [`RecoveryManager::retry_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Undo steps that succeeded and were removed
    pub recovered: usize,
    /// Undo steps that failed again and will be retried
    pub retrying: usize,
    /// Undo steps that failed their last allowed attempt
    pub abandoned: usize,
}

/// Holds failed rollback steps and retries them on demand.
#[derive(Debug)]
pub struct RecoveryManager {
    entries: Mutex<Vec<FailedOperation>>,
    max_attempts: u32,
    max_age: Duration,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_AGE)
    }
}

impl RecoveryManager {
    pub fn new(max_attempts: u32, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_attempts,
            max_age,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.recovery_max_attempts, config.recovery_max_age)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Park an operation whose rollback step failed with `error`.
    pub async fn register(&self, operation: Operation, error: String) {
        error!(
            operation = operation.description(),
            error = %error,
            "Rollback step failed, queued for recovery"
        );
        self.entries.lock().await.push(FailedOperation::new(operation, error));
    }

    /// Retry the rollback step of every recoverable entry once.
    ///
    /// Entries are retried in place and only removed once their undo step
    /// succeeds, so dropping this future part-way leaves every entry not yet
    /// recovered parked. An attempt interrupted that way still counts.
    #[instrument(level = "info", skip(self))]
    pub async fn retry_pending(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut entries = self.entries.lock().await;

        let mut index = 0;
        while index < entries.len() {
            let entry = &mut entries[index];
            if !entry.recoverable {
                index += 1;
                continue;
            }

            entry.attempts += 1;
            match entry.operation.undo().await {
                Ok(()) => {
                    info!(
                        operation = entry.operation.description(),
                        attempts = entry.attempts,
                        "Recovered failed rollback"
                    );
                    entries.remove(index);
                    report.recovered += 1;
                }
                Err(e) => {
                    entry.error = e.to_string();
                    if entry.attempts >= self.max_attempts {
                        entry.recoverable = false;
                        error!(
                            operation = entry.operation.description(),
                            attempts = entry.attempts,
                            error = %entry.error,
                            "Giving up on failed rollback"
                        );
                        report.abandoned += 1;
                    } else {
                        warn!(
                            operation = entry.operation.description(),
                            attempts = entry.attempts,
                            error = %entry.error,
                            "Recovery attempt failed"
                        );
                        report.retrying += 1;
                    }
                    index += 1;
                }
            }
        }

        report
    }

    /// Drop entries older than the configured max age. Returns how many were
    /// dropped.
    pub async fn prune_expired(&self) -> usize {
        let max_age = TimeDelta::from_std(self.max_age).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();

        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| {
            let expired = entry.age(now) > max_age;
            if expired {
                warn!(
                    operation = entry.operation.description(),
                    error = %entry.error,
                    "Dropping expired failed rollback"
                );
            }
            !expired
        });
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned expired recovery entries");
        }
        pruned
    }

    pub async fn pending(&self) -> Vec<PendingRecovery> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| PendingRecovery {
                description: entry.operation.description().to_string(),
                error: entry.error.clone(),
                failed_at: entry.failed_at,
                attempts: entry.attempts,
                recoverable: entry.recoverable,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
