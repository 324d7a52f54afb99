//! Reversible unit of work.

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Error type produced by operation steps.
///
/// Steps mix filesystem and metadata-store calls, so the concrete error is
/// erased; the description plus `Display` of the cause is what gets reported.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Future returned by a single step.
pub type StepFuture = BoxFuture<'static, Result<(), BoxError>>;

type Step = Box<dyn FnMut() -> StepFuture + Send>;

/// An `execute` step paired with the `rollback` step that undoes it.
///
/// Steps are closures that build a fresh future per call, so a rollback
/// that failed can be attempted again later by the recovery manager.
/// Closures typically capture `Arc` handles and owned paths:
///
/// ```ignore
/// let op = Operation::new(
///     "insert record /a.txt",
///     {
///         let store = Arc::clone(&store);
///         let record = record.clone();
///         move || {
///             let store = Arc::clone(&store);
///             let record = record.clone();
///             async move { store.insert(record).await.map_err(Into::into) }
///         }
///     },
///     {
///         let store = Arc::clone(&store);
///         move || {
///             let store = Arc::clone(&store);
///             async move { store.delete("/a.txt").await.map_err(Into::into) }
///         }
///     },
/// );
/// ```
pub struct Operation {
    description: String,
    execute: Step,
    rollback: Step,
}

impl Operation {
    pub fn new<E, EF, R, RF>(description: impl Into<String>, mut execute: E, mut rollback: R) -> Self
    where
        E: FnMut() -> EF + Send + 'static,
        EF: Future<Output = Result<(), BoxError>> + Send + 'static,
        R: FnMut() -> RF + Send + 'static,
        RF: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            description: description.into(),
            execute: Box::new(move || execute().boxed()),
            rollback: Box::new(move || rollback().boxed()),
        }
    }

    /// Human-readable label used in errors and logs.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) async fn run(&mut self) -> Result<(), BoxError> {
        (self.execute)().await
    }

    pub(crate) async fn undo(&mut self) -> Result<(), BoxError> {
        (self.rollback)().await
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
