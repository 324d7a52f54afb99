//! Background removal of orphaned temp files.
//!
//! A crash between creating a temp file and renaming (or removing) it leaves
//! the temp file behind. The sweeper periodically deletes `*.tmp` entries in
//! the temp directory whose modification time is older than the retention
//! threshold.
//!
//! Sweeping is best-effort: every failure is logged and swallowed, and the
//! foreground operations never wait on it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::temp::TEMP_SUFFIX;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default age after which a temp entry is considered orphaned.
pub const DEFAULT_TEMP_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Temp entries examined
    pub scanned: usize,
    /// Entries removed because they were older than the retention
    pub removed: usize,
    /// Entries that were old enough but could not be removed
    pub failed: usize,
}

/// Remove `*.tmp` entries in `temp_dir` older than `retention`.
///
/// Only an unreadable temp directory is reported as an error; per-entry
/// failures are counted in [`SweepReport::failed`]. A missing directory is an
/// empty sweep.
#[instrument(level = "debug", skip_all, fields(temp_dir = %temp_dir.display(), retention_secs = retention.as_secs()))]
pub async fn sweep_temp_dir(temp_dir: &Path, retention: Duration) -> io::Result<SweepReport> {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }
        report.scanned += 1;

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            // Renamed into place while we were scanning
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(entry = ?name, error = %e, "Failed to stat temp entry");
                report.failed += 1;
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age <= retention {
            continue;
        }

        let path = entry.path();
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(entry = ?name, age_secs = age.as_secs(), "Removed orphaned temp entry");
                report.removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(entry = ?name, error = %e, "Failed to remove orphaned temp entry");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Handle to the periodic sweeper task.
///
/// Dropping the handle (or calling [`SweeperHandle::shutdown`]) stops the
/// task after one final sweep.
#[derive(Debug)]
pub(crate) struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Start the sweeper on the current tokio runtime.
    pub(crate) fn spawn(temp_dir: PathBuf, interval: Duration, retention: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_sweeper(temp_dir, interval, retention, shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal shutdown and wait for the final sweep to finish.
    pub(crate) async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        // The receiver is gone only if the task already exited
        let _ = self.shutdown.send(true);
        self.task.await
    }
}

async fn run_sweeper(
    temp_dir: PathBuf,
    interval: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first sweep runs one interval in.
    ticker.tick().await;

    debug!(temp_dir = %temp_dir.display(), interval_secs = interval.as_secs(), "Temp sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_and_log(&temp_dir, retention).await,
            // Fires on an explicit signal and when the sender is dropped
            _ = shutdown.changed() => break,
        }
    }

    sweep_and_log(&temp_dir, retention).await;
    debug!(temp_dir = %temp_dir.display(), "Temp sweeper stopped");
}

async fn sweep_and_log(temp_dir: &Path, retention: Duration) {
    match sweep_temp_dir(temp_dir, retention).await {
        Ok(report) if report.removed > 0 || report.failed > 0 => {
            info!(removed = report.removed, failed = report.failed, "Swept orphaned temp files");
        }
        Ok(_) => {}
        Err(e) => warn!(temp_dir = %temp_dir.display(), error = %e, "Temp sweep failed"),
    }
}
