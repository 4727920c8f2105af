//! Smoke tests -- verify the binary runs and the operator subcommands work
//! against a real database file.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn clustercron() -> Command {
    let mut cmd = Command::cargo_bin("clustercron").unwrap();
    cmd.env_remove("CLUSTERCRON_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// Write a config pointing at `db` and return its path.
fn write_config(dir: &Path, db: &Path) -> PathBuf {
    let path = dir.join("clustercron.toml");
    std::fs::write(
        &path,
        format!(
            "[node]\nid = \"smoke-node\"\n\n[storage]\ndatabase_path = {:?}\n\n[logging]\nlevel = \"warn\"\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    clustercron()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cluster-aware cron scheduler"));
}

#[test]
fn test_cli_version() {
    clustercron()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("clustercron"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["history", "--help"],
        vec!["stats", "--help"],
        vec!["locks", "list", "--help"],
        vec!["prune", "--help"],
        vec!["check-schedule", "--help"],
    ] {
        clustercron().args(&args).assert().success();
    }
}

#[test]
fn test_check_schedule_previews_fire_times() {
    clustercron()
        .args(["check-schedule", "0 2 * * *", "--count", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("Next 3 fire time(s)"))
        .stdout(predicate::str::contains("T02:00:00.000Z"));
}

#[test]
fn test_check_schedule_rejects_garbage() {
    clustercron()
        .args(["check-schedule", "61 * * * *"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("schedule rejected"));
}

#[test]
fn test_history_requires_existing_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &dir.path().join("missing.db"));

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["history", "--task", "cleanup"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no database at"));
    assert!(!dir.path().join("missing.db").exists());
}

#[test]
fn test_missing_config_file_is_an_error() {
    clustercron()
        .args(["--config", "/nonexistent/clustercron.toml", "check-schedule", "@daily"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_locks_disable_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    clustercron::storage::open_pool(&db.to_string_lossy()).unwrap();
    let config = write_config(dir.path(), &db);

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["locks", "disable", "--task", "backup-daily"])
        .assert()
        .success()
        .stdout(predicate::str::contains("disabled cluster-wide"));

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["locks", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"task_name\": \"backup-daily\""))
        .stdout(predicate::str::contains("\"enabled\": false"));
}

#[test]
fn test_history_stats_and_prune_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    clustercron::storage::open_pool(&db.to_string_lossy()).unwrap();
    let config = write_config(dir.path(), &db);

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["history", "--task", "cleanup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No executions recorded"));

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["stats", "--task", "cleanup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Runs:         0"))
        .stdout(predicate::str::contains("never"));

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["prune", "--days", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 0 execution(s) older than 30 days"));
}

#[test]
fn test_broken_env_config_warns_before_falling_back() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[scheduler]\nlease_window_secs = 0\n").unwrap();

    Command::cargo_bin("clustercron")
        .unwrap()
        .env("CLUSTERCRON_CONFIG", &broken)
        .env_remove("RUST_LOG")
        .args(["check-schedule", "@daily", "--count", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("CLUSTERCRON_CONFIG set but file could not be loaded"))
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_explicit_config_with_zero_lease_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("clustercron.toml");
    std::fs::write(&config, "[scheduler]\nlease_window_secs = 0\n").unwrap();

    clustercron()
        .arg("--config")
        .arg(&config)
        .args(["check-schedule", "@daily"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lease_window_secs must be between 1"));
}
