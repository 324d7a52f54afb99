//! Multi-step operations with compensating rollback.
//!
//! A [`TransactionManager`] runs a sequence of [`Operation`]s. If one fails,
//! every operation that already succeeded is undone in reverse order. Undo
//! steps that fail are handed to the attached [`RecoveryManager`] so the
//! inconsistency is not lost.
//!
//! ```ignore
//! let mut tx = TransactionManager::new().with_recovery(Arc::clone(&recovery));
//! tx.add_operation(move_physical_file)?;
//! tx.add_operation(rename_metadata_record)?;
//! tx.execute().await?;
//! ```

mod operation;
pub mod recovery;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

pub use operation::{BoxError, Operation, StepFuture};
pub use recovery::{FailedOperation, PendingRecovery, RecoveryManager, RecoveryReport};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations
    Pending,
    /// Running operations or rolling them back
    Executing,
    /// Every operation succeeded
    Committed,
    /// An operation failed and every undo step succeeded
    RolledBack,
    /// An operation failed and at least one undo step also failed
    RollbackFailed,
}

/// An undo step that failed during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    /// Zero-based position of the operation in the transaction
    pub index: usize,
    pub description: String,
    pub error: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation {} ({}): {}", self.index, self.description, self.error)
    }
}

fn summarize(failures: &[RollbackFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by [`TransactionManager`].
///
/// Every failure variant names the operation that failed (zero-based
/// `index` in the order operations were added) and its cause.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Operation failed; every executed operation was undone.
    #[error("operation {index} ({description}) failed: {cause} (rollback successful)")]
    RolledBack {
        index: usize,
        description: String,
        #[source]
        cause: BoxError,
    },

    /// Operation failed; some undo steps succeeded and some failed.
    #[error("operation {index} ({description}) failed: {cause} (rollback partially failed: {})", summarize(.failures))]
    PartialRollback {
        index: usize,
        description: String,
        #[source]
        cause: BoxError,
        failures: Vec<RollbackFailure>,
    },

    /// Operation failed and every undo step attempted also failed.
    #[error("operation {index} ({description}) failed: {cause} (rollback also failed: {})", summarize(.failures))]
    RollbackFailed {
        index: usize,
        description: String,
        #[source]
        cause: BoxError,
        failures: Vec<RollbackFailure>,
    },

    #[error("transaction already executed (state: {state:?})")]
    AlreadyExecuted { state: TransactionState },
}

impl TransactionError {
    /// True when the failed transaction left no partial effects behind.
    pub fn is_consistent(&self) -> bool {
        matches!(self, TransactionError::RolledBack { .. })
    }

    /// Zero-based index of the operation whose execute step failed.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            TransactionError::RolledBack { index, .. }
            | TransactionError::PartialRollback { index, .. }
            | TransactionError::RollbackFailed { index, .. } => Some(*index),
            TransactionError::AlreadyExecuted { .. } => None,
        }
    }

    /// Undo steps that failed, empty when rollback succeeded.
    pub fn rollback_failures(&self) -> &[RollbackFailure] {
        match self {
            TransactionError::PartialRollback { failures, .. }
            | TransactionError::RollbackFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Single-use sequencer of reversible operations.
#[derive(Debug)]
pub struct TransactionManager {
    state: TransactionState,
    pending: Vec<Operation>,
    /// Operations whose execute step succeeded, with their original index
    executed: Vec<(usize, Operation)>,
    recovery: Option<Arc<RecoveryManager>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Pending,
            pending: Vec::new(),
            executed: Vec::new(),
            recovery: None,
        }
    }

    /// Hand failed undo steps to `recovery` instead of only logging them.
    #[must_use]
    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of operations queued.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue an operation. Nothing runs until [`execute`](Self::execute).
    pub fn add_operation(&mut self, operation: Operation) -> Result<(), TransactionError> {
        if self.state != TransactionState::Pending {
            return Err(TransactionError::AlreadyExecuted { state: self.state });
        }
        trace!(operation = operation.description(), "Operation queued");
        self.pending.push(operation);
        Ok(())
    }

    /// Run every queued operation in order.
    ///
    /// On the first failure the remaining operations are discarded without
    /// running and the executed ones are undone in reverse order.
    #[instrument(level = "debug", skip(self), fields(operations = self.pending.len()))]
    pub async fn execute(&mut self) -> Result<(), TransactionError> {
        if self.state != TransactionState::Pending {
            return Err(TransactionError::AlreadyExecuted { state: self.state });
        }
        self.state = TransactionState::Executing;

        let pending = std::mem::take(&mut self.pending);
        for (index, mut operation) in pending.into_iter().enumerate() {
            match operation.run().await {
                Ok(()) => {
                    trace!(index, operation = operation.description(), "Operation executed");
                    self.executed.push((index, operation));
                }
                Err(cause) => {
                    let description = operation.description().to_string();
                    warn!(index, operation = %description, error = %cause, "Operation failed, rolling back");
                    return Err(self.roll_back(index, description, cause).await);
                }
            }
        }

        self.executed.clear();
        self.state = TransactionState::Committed;
        debug!("Transaction committed");
        Ok(())
    }

    async fn roll_back(&mut self, index: usize, description: String, cause: BoxError) -> TransactionError {
        let mut attempted = 0usize;
        let mut failures = Vec::new();

        while let Some((op_index, mut operation)) = self.executed.pop() {
            attempted += 1;
            match operation.undo().await {
                Ok(()) => trace!(index = op_index, operation = operation.description(), "Operation undone"),
                Err(e) => {
                    let error = e.to_string();
                    error!(
                        index = op_index,
                        operation = operation.description(),
                        error = %error,
                        "Rollback step failed"
                    );
                    failures.push(RollbackFailure {
                        index: op_index,
                        description: operation.description().to_string(),
                        error: error.clone(),
                    });
                    if let Some(recovery) = &self.recovery {
                        recovery.register(operation, error).await;
                    }
                }
            }
        }

        if failures.is_empty() {
            self.state = TransactionState::RolledBack;
            info!(index, operation = %description, undone = attempted, "Transaction rolled back");
            TransactionError::RolledBack {
                index,
                description,
                cause,
            }
        } else if failures.len() == attempted {
            self.state = TransactionState::RollbackFailed;
            TransactionError::RollbackFailed {
                index,
                description,
                cause,
                failures,
            }
        } else {
            self.state = TransactionState::RollbackFailed;
            TransactionError::PartialRollback {
                index,
                description,
                cause,
                failures,
            }
        }
    }
}
