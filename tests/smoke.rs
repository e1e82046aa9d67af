//! Smoke tests -- verify the binary runs and key subcommands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("incidentbot.toml");
    let db = dir.join("smoke.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\ndb_path = \"{}\"\n\n[alerting]\nenabled = false\n\n[logging]\nlevel = \"warn\"\n",
            db.display()
        ),
    )
    .unwrap();
    path
}

fn cmd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("incidentbot").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("incidentbot")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("incident detection"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("incidentbot")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("incidentbot"));
}

#[test]
fn test_incidents_list_subcommand_exists() {
    Command::cargo_bin("incidentbot")
        .unwrap()
        .args(["incidents", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("incidentbot")
        .unwrap()
        .args(["--config", "/nonexistent/incidentbot.toml", "incidents", "stats"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_ingest_detect_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    for _ in 0..3 {
        cmd(&config)
            .args(["ingest", "metric", "--name", "cpu_usage_percent", "--value", "95", "--service", "checkout"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Recorded metric"));
    }

    cmd(&config)
        .arg("detect")
        .assert()
        .success()
        .stdout(predicate::str::contains("opened 1 incident(s)"));

    cmd(&config)
        .args(["incidents", "list", "--status", "open"])
        .assert()
        .success()
        .stdout(predicate::str::contains("RESOURCE_EXHAUSTION").and(predicate::str::contains("checkout")));

    cmd(&config)
        .args(["incidents", "update", "1", "--status", "resolved", "--resolved-by", "oncall"])
        .assert()
        .success()
        .stdout(predicate::str::contains("RESOLVED"));

    cmd(&config)
        .args(["incidents", "update", "1", "--status", "bogus"])
        .assert()
        .failure();
}

#[test]
fn test_ingest_log_rejects_unknown_level() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cmd(&config)
        .args(["ingest", "log", "--level", "warning", "--message", "slow", "--service", "search"])
        .assert()
        .success();

    cmd(&config)
        .args(["ingest", "log", "--level", "loud", "--message", "x", "--service", "search"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}

#[test]
fn test_test_alert_without_webhook_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cmd(&config).arg("test-alert").assert().failure();
}
