//! CLI 命令测试

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

fn reaper() -> Command {
    let mut cmd = Command::cargo_bin("aiw-reaper").unwrap();
    for key in [
        "AIW_REAPER_SCAN_INTERVAL_MS",
        "AIW_REAPER_ANALYSIS_INTERVAL_MS",
        "AIW_REAPER_CONFIDENCE_THRESHOLD",
        "AIW_REAPER_MAX_RETRIES",
        "AIW_REAPER_RETRY_DELAY_MS",
        "AIW_REAPER_CLEANUP_TIMEOUT_MS",
        "AIW_REAPER_PARALLEL_LIMIT",
        "AIW_REAPER_SAFETY_CHECKS",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
#[serial]
fn config_command_prints_effective_configuration() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reaper.json");
    fs::write(&path, r#"{ "monitor": { "scanIntervalMs": 1234 } }"#).unwrap();

    reaper()
        .arg("config")
        .arg("--config")
        .arg(&path)
        .env("AIW_REAPER_PARALLEL_LIMIT", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scanIntervalMs\": 1234"))
        .stdout(predicate::str::contains("\"parallelCleanupLimit\": 7"));
}

#[test]
#[serial]
fn invalid_configuration_fails_fast() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reaper.json");
    fs::write(&path, r#"{ "cleaner": { "cleanupMethods": [] } }"#).unwrap();

    reaper()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cleaner.cleanupMethods"));
}

#[test]
fn help_lists_subcommands() {
    reaper()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scan"))
        .stdout(predicate::str::contains("analyze"));
}
