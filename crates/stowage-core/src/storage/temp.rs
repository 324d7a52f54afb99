//! Temp file naming and cleanup guard.
//!
//! Temp files are named `<basename>.<unix-timestamp>.<random-id>.tmp` and live
//! in the storage root's temp directory, never next to their target.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{trace, warn};
use uuid::Uuid;

/// Suffix shared by every temp entry; the sweeper only touches these.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Longest basename prefix kept in a temp name, so the full name stays under
/// common 255-byte filename limits.
const MAX_BASENAME_PREFIX: usize = 128;

/// Build a unique temp file name for `target`.
pub(crate) fn temp_file_name(target: &Path) -> String {
    let base = target
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
    let base = truncate_at_char_boundary(&base, MAX_BASENAME_PREFIX);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    format!("{base}.{timestamp}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple())
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A temp path that is removed on drop unless it was renamed into place.
///
/// Dropping covers every early exit, including a cancelled writer future.
#[derive(Debug)]
pub(crate) struct TempFile {
    path: PathBuf,
    finished: bool,
}

impl TempFile {
    pub(crate) fn new_in(temp_dir: &Path, target: &Path) -> Self {
        Self {
            path: temp_dir.join(temp_file_name(target)),
            finished: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The temp file has been renamed onto its target; nothing to clean up.
    pub(crate) fn persisted(mut self) {
        self.finished = true;
    }

    /// Remove the temp file now. Missing files are fine.
    pub(crate) async fn discard(mut self) {
        self.finished = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => trace!(temp_path = %self.path.display(), "Temp file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                temp_path = %self.path.display(),
                error = %e,
                "Failed to remove temp file, leaving it for the sweeper"
            ),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.finished {
            // Best-effort synchronous cleanup
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
