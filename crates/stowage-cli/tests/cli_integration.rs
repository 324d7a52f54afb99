#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// `stowage` pointed at `root`, with ambient configuration cleared.
fn stowage(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stowage").unwrap();
    cmd.env_remove("STOWAGE_CONFIG")
        .env_remove("RUST_LOG")
        .env("STOWAGE_ROOT", root);
    cmd
}

fn temp_root() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path().join("store");
    (dir, root)
}

fn put(root: &Path, path: &str, content: &str) {
    stowage(root).args(["put", path]).write_stdin(content).assert().success();
}

// ============ put / cat ============

#[test]
fn test_put_stdin_then_cat() {
    let (_dir, root) = temp_root();
    put(&root, "/docs/hello.txt", "hello, world\n");

    stowage(&root)
        .args(["cat", "/docs/hello.txt"])
        .assert()
        .success()
        .stdout("hello, world\n");
    assert_eq!(std::fs::read_to_string(root.join("docs/hello.txt")).unwrap(), "hello, world\n");
}

#[test]
fn test_put_from_local_file() {
    let (dir, root) = temp_root();
    let local = dir.path().join("local.bin");
    std::fs::write(&local, [0u8, 1, 2, 3, 255]).unwrap();

    stowage(&root)
        .args(["put", "/bin/data.bin", "--input"])
        .arg(&local)
        .assert()
        .success();

    stowage(&root)
        .args(["cat", "/bin/data.bin"])
        .assert()
        .success()
        .stdout(vec![0u8, 1, 2, 3, 255]);
}

#[test]
fn test_put_overwrites_and_leaves_no_temp_files() {
    let (_dir, root) = temp_root();
    put(&root, "/a.txt", "first");
    put(&root, "/a.txt", "second");

    assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "second");
    assert_eq!(std::fs::read_dir(root.join(".tmp")).unwrap().count(), 0);
}

#[cfg(unix)]
#[test]
fn test_put_applies_mode() {
    use std::os::unix::fs::PermissionsExt;

    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["put", "/secret.txt", "--mode", "600"])
        .write_stdin("shh")
        .assert()
        .success();

    let mode = std::fs::metadata(root.join("secret.txt")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_put_rejects_traversal() {
    let (dir, root) = temp_root();
    stowage(&root)
        .args(["put", "/a/../../escape.txt"])
        .write_stdin("nope")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("path traversal detected"));
    assert!(!dir.path().join("escape.txt").exists());
}

#[test]
fn test_put_rejects_reserved_name() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["put", "/docs/CON.txt"])
        .write_stdin("x")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid filename"));
}

#[test]
fn test_put_missing_local_file() {
    let (dir, root) = temp_root();
    stowage(&root)
        .args(["put", "/x.txt", "--input"])
        .arg(dir.path().join("absent"))
        .assert()
        .code(3);
}

#[test]
fn test_cat_missing_file() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["cat", "/nothing.txt"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_errors_do_not_reveal_root() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["cat", "/nothing.txt"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains(root.to_string_lossy().as_ref()).not());
}

#[test]
fn test_temp_dir_is_off_limits() {
    let (_dir, root) = temp_root();
    put(&root, "/real.txt", "data");
    let in_flight = root.join(".tmp").join("real.txt.1700000000.0123abcd.tmp");
    std::fs::write(&in_flight, "half written").unwrap();

    stowage(&root)
        .args(["put", "/.tmp/report.tmp"])
        .write_stdin("sneaky")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("reserved"));
    stowage(&root)
        .args(["cat", "/.tmp/real.txt.1700000000.0123abcd.tmp"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
    stowage(&root).args(["rm", "-f", "/.tmp"]).assert().code(2);
    stowage(&root).args(["mv", "/real.txt", "/.TMP/real.txt"]).assert().code(2);
    stowage(&root).args(["mkdir", "/.tmp/nested"]).assert().code(2);
    stowage(&root).args(["check", "/.tmp/x"]).assert().code(2);

    assert!(root.join(".tmp").is_dir());
    assert!(in_flight.exists());
    assert!(!root.join(".tmp/report.tmp").exists());
    assert!(root.join("real.txt").exists());
}

// ============ cp / mv / rm / mkdir ============

#[test]
fn test_cp_keeps_source() {
    let (_dir, root) = temp_root();
    put(&root, "/src.txt", "copy me");

    stowage(&root).args(["cp", "/src.txt", "/backup/dst.txt"]).assert().success();

    assert_eq!(std::fs::read_to_string(root.join("src.txt")).unwrap(), "copy me");
    assert_eq!(std::fs::read_to_string(root.join("backup/dst.txt")).unwrap(), "copy me");
}

#[test]
fn test_mv_moves_file() {
    let (_dir, root) = temp_root();
    put(&root, "/inbox/a.txt", "moving");

    stowage(&root).args(["mv", "/inbox/a.txt", "/archive/a.txt"]).assert().success();

    assert!(!root.join("inbox/a.txt").exists());
    stowage(&root)
        .args(["cat", "/archive/a.txt"])
        .assert()
        .success()
        .stdout("moving");
}

#[test]
fn test_mv_missing_source() {
    let (_dir, root) = temp_root();
    stowage(&root).args(["mv", "/ghost.txt", "/b.txt"]).assert().code(3);
}

#[test]
fn test_rm_file_and_missing() {
    let (_dir, root) = temp_root();
    put(&root, "/gone.txt", "bye");

    stowage(&root).args(["rm", "/gone.txt"]).assert().success();
    assert!(!root.join("gone.txt").exists());

    stowage(&root).args(["rm", "/gone.txt"]).assert().code(3);
    stowage(&root).args(["rm", "-f", "/gone.txt"]).assert().success();
}

#[test]
fn test_rm_refuses_root() {
    let (_dir, root) = temp_root();
    put(&root, "/keep.txt", "still here");

    stowage(&root).args(["rm", "-f", "/"]).assert().code(2);
    assert!(root.join("keep.txt").exists());
}

#[test]
fn test_mkdir_then_rm_directory() {
    let (_dir, root) = temp_root();
    stowage(&root).args(["mkdir", "/a/b/c"]).assert().success();
    assert!(root.join("a/b/c").is_dir());

    put(&root, "/a/b/c/file.txt", "nested");
    stowage(&root).args(["rm", "/a"]).assert().success();
    assert!(!root.join("a").exists());
}

// ============ check ============

#[test]
fn test_check_prints_normalized_paths() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["check", "docs//./report.pdf", "\\win\\style.txt"])
        .assert()
        .success()
        .stdout("/docs/report.pdf\n/win/style.txt\n");
    assert!(!root.exists(), "check must not create the root");
}

#[test]
fn test_check_rejects_traversal() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["check", "/ok.txt", "%2e%2e/etc/passwd"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("/ok.txt"))
        .stdout(predicate::str::contains("path traversal detected"))
        .stderr(predicate::str::contains("1 of 2 paths rejected"));
}

// ============ sweep / stats ============

#[test]
fn test_sweep_removes_only_expired_temp_files() {
    let (_dir, root) = temp_root();
    put(&root, "/real.txt", "data");

    let temp = root.join(".tmp");
    let stale = temp.join("real.txt.1700000000.0123abcd.tmp");
    let fresh = temp.join("real.txt.1700000001.4567ef01.tmp");
    std::fs::write(&stale, "orphan").unwrap();
    std::fs::write(&fresh, "in flight").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&stale)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(2 * 60 * 60))
        .unwrap();

    stowage(&root)
        .args(["sweep", "--retention", "1h"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scanned 2 removed 1 failed 0"));

    assert!(!stale.exists());
    assert!(fresh.exists());
    assert!(root.join("real.txt").exists());
}

#[test]
fn test_sweep_rejects_bad_duration() {
    let (_dir, root) = temp_root();
    stowage(&root).args(["sweep", "--retention", "soon"]).assert().code(2);
}

#[test]
fn test_stats() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("temp files:   0 (0 bytes)"))
        .stdout(predicate::str::contains("active locks: 0"));
}

// ============ configuration ============

#[test]
fn test_missing_root_is_rejected() {
    Command::cargo_bin("stowage")
        .unwrap()
        .env_remove("STOWAGE_ROOT")
        .env_remove("STOWAGE_CONFIG")
        .arg("stats")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no storage root"));
}

#[test]
fn test_config_file_supplies_root() {
    let (dir, root) = temp_root();
    let config = dir.path().join("stowage.toml");
    std::fs::write(
        &config,
        format!("root = {:?}\ntemp_dir_name = \".staging\"\n", root.to_string_lossy()),
    )
    .unwrap();

    Command::cargo_bin("stowage")
        .unwrap()
        .env_remove("STOWAGE_ROOT")
        .arg("--config")
        .arg(&config)
        .args(["put", "/via-config.txt"])
        .write_stdin("configured")
        .assert()
        .success();

    assert!(root.join("via-config.txt").exists());
    assert!(root.join(".staging").is_dir());
}

#[test]
fn test_config_file_unknown_key_is_rejected() {
    let (dir, root) = temp_root();
    let config = dir.path().join("stowage.toml");
    std::fs::write(&config, "root = \"/tmp/x\"\nsweep_intervall = \"1m\"\n").unwrap();

    stowage(&root).arg("--config").arg(&config).arg("stats").assert().code(2);
}

#[test]
fn test_quiet_suppresses_error_output() {
    let (_dir, root) = temp_root();
    stowage(&root)
        .args(["-q", "cat", "/nothing.txt"])
        .assert()
        .code(3)
        .stderr(predicate::str::is_empty());
}
