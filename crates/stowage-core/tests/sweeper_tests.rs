//! Orphaned temp file sweeping through the storage lifecycle.

mod common;

use std::path::Path;
use std::time::{Duration, SystemTime};

use common::TestStorage;
use stowage_core::storage::{SweepReport, sweep_temp_dir};

fn plant(dir: &Path, name: &str, age: Duration) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"orphan").unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
    path
}

#[tokio::test]
async fn test_background_sweeper_removes_expired_temp_files() {
    let t = TestStorage::with_config(|config| {
        config
            .sweeper_enabled(true)
            .sweep_interval(Duration::from_millis(25))
            .temp_retention(Duration::from_secs(60 * 60))
    })
    .await;
    let temp_dir = t.storage.temp_dir().to_path_buf();
    let expired = plant(&temp_dir, "report.pdf.1700000000.0123abcd.tmp", Duration::from_secs(2 * 60 * 60));
    let fresh = plant(&temp_dir, "report.pdf.1700000001.4567ef01.tmp", Duration::from_secs(60));

    let mut swept = false;
    for _ in 0..200 {
        if !expired.exists() {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(swept, "expired temp file should be swept");
    assert!(fresh.exists(), "recent temp file must be kept");
    t.storage.close().await.unwrap();
    assert!(fresh.exists(), "final sweep honors retention too");
}

#[tokio::test]
async fn test_close_runs_final_sweep() {
    let t = TestStorage::with_config(|config| {
        config
            .sweeper_enabled(true)
            .sweep_interval(Duration::from_secs(3600))
            .temp_retention(Duration::from_secs(1))
    })
    .await;
    let stale = plant(t.storage.temp_dir(), "x.1.abcd.tmp", Duration::from_secs(30));

    t.storage.close().await.unwrap();
    assert!(!stale.exists());
}

#[tokio::test]
async fn test_manual_sweep_ignores_non_temp_entries() {
    let t = TestStorage::open().await;
    let temp_dir = t.storage.temp_dir();
    plant(temp_dir, "old.1.aaaa.tmp", Duration::from_secs(7200));
    let note = plant(temp_dir, "README", Duration::from_secs(7200));

    let report = sweep_temp_dir(temp_dir, Duration::from_secs(3600)).await.unwrap();

    assert_eq!(report, SweepReport { scanned: 1, removed: 1, failed: 0 });
    assert!(note.exists());
}
