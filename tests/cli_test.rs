//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cinder() -> Command {
    Command::cargo_bin("cinder").expect("binary builds")
}

#[test]
fn test_init_creates_cache_file() {
    let dir = TempDir::new().unwrap();
    let cache_file = dir.path().join("emb.cache");

    cinder()
        .args(["init", "--cache-file"])
        .arg(&cache_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cache ready"));

    assert!(cache_file.exists());
}

#[test]
fn test_init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let cache_file = dir.path().join("emb.cache");

    for _ in 0..2 {
        cinder()
            .args(["init", "--cache-file"])
            .arg(&cache_file)
            .assert()
            .success();
    }
}

#[test]
fn test_stats_reports_empty_cache() {
    let dir = TempDir::new().unwrap();
    let cache_file = dir.path().join("emb.cache");

    cinder()
        .args(["init", "--cache-file"])
        .arg(&cache_file)
        .assert()
        .success();

    cinder()
        .args(["stats", "--cache-file"])
        .arg(&cache_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"slots_used\": 0"));
}

#[test]
fn test_help_hides_worker_subcommand() {
    cinder()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bench"))
        .stdout(predicate::str::contains("worker").not());
}
