//! Tests for the impairlab command line
//!
//! Only the commands that need no privileges are exercised here; `run`
//! needs namespaces, tc and docker.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli_command() -> Command {
    Command::cargo_bin("impairlab").expect("Failed to find impairlab binary")
}

#[test]
fn test_cli_list_command() {
    let mut cmd = cli_command();
    cmd.arg("list");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Available presets:"))
        .stdout(predicate::str::contains("dynamic"))
        .stdout(predicate::str::contains("static"));
}

#[test]
fn test_cli_help_mentions_autotest() {
    let mut cmd = cli_command();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--autotest"))
        .stdout(predicate::str::contains("--preset"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn test_cli_show_dynamic_preset() {
    let mut cmd = cli_command();
    cmd.args(["show", "--preset", "dynamic", "--seed", "42"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"dynamic\""))
        .stdout(predicate::str::contains("\"middle\""))
        .stdout(predicate::str::contains("\"seed\": 42"));
}

#[test]
fn test_cli_show_unknown_preset() {
    let mut cmd = cli_command();
    cmd.args(["show", "--preset", "mesh"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset: mesh"));
}

#[test]
fn test_cli_show_config_file_with_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lab.json");
    std::fs::write(
        &path,
        r#"{
            "name": "pair",
            "hosts": [
                {"id": "server", "addr": "10.0.0.1/8"},
                {"id": "client", "addr": "10.0.0.2/8"}
            ],
            "links": [{"id": "middle", "a": "server", "b": "client", "delay_ms": 20}]
        }"#,
    )
    .unwrap();

    let mut cmd = cli_command();
    cmd.args(["show", "--shared-dir", "/tmp/pair-out", "--config"])
        .arg(&path);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"pair\""))
        .stdout(predicate::str::contains("/tmp/pair-out"));
}

#[test]
fn test_cli_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(
        &path,
        r#"{
            "name": "broken",
            "hosts": [{"id": "server", "addr": "10.0.0.1/8"}],
            "links": [{"a": "server", "b": "nowhere"}]
        }"#,
    )
    .unwrap();

    let mut cmd = cli_command();
    cmd.arg("show").arg("--config").arg(&path);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown node 'nowhere'"));
}

#[test]
fn test_cli_preset_and_config_conflict() {
    let mut cmd = cli_command();
    cmd.args(["show", "--preset", "static", "--config", "lab.json"]);

    cmd.assert().failure();
}
