//! Smoke tests for the `pil` ops binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pil() -> Command {
    Command::cargo_bin("pil").expect("binary builds")
}

#[test]
fn test_status_on_empty_runtime_root() {
    let temp = TempDir::new().expect("temp dir");
    pil()
        .current_dir(temp.path())
        .args(["status", "--runtime-root"])
        .arg(temp.path().join("runtime"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Coordinator status"))
        .stdout(predicate::str::contains("none"));
}

#[test]
fn test_status_json_format() {
    let temp = TempDir::new().expect("temp dir");
    pil()
        .current_dir(temp.path())
        .args(["status", "--format", "json", "--runtime-root"])
        .arg(temp.path().join("runtime"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"active_instances\": 0"));
}

#[test]
fn test_stop_writes_signal_file() {
    let temp = TempDir::new().expect("temp dir");
    pil()
        .current_dir(temp.path())
        .args(["stop", "--project"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Stop signal written"));

    let signal = temp
        .path()
        .join(".pi")
        .join("self-improvement-loop")
        .join("stop-signal");
    let content = std::fs::read_to_string(signal).expect("signal exists");
    assert_eq!(content, "STOP");
}

#[test]
fn test_config_shows_resolved_values() {
    let temp = TempDir::new().expect("temp dir");
    pil()
        .current_dir(temp.path())
        .args(["config", "--runtime-root"])
        .arg(temp.path().join("runtime"))
        .assert()
        .success()
        .stdout(predicate::str::contains("total-max-llm"));
}

#[test]
fn test_cleanup_on_empty_root() {
    let temp = TempDir::new().expect("temp dir");
    pil()
        .current_dir(temp.path())
        .args(["cleanup", "--runtime-root"])
        .arg(temp.path().join("runtime"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 instance record(s)"));
}
