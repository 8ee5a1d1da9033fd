//! `tracking-conformance` binary tests: exit codes and the JSON report

#![cfg(unix)]

use std::fs;
use std::process::Command;

use tracking_conformance::testing::{file_store_client_script, write_client_script};
use tracking_conformance::workload::WorkloadSpec;

const HARNESS: &str = env!("CARGO_BIN_EXE_tracking-conformance");

fn good_client(dir: &std::path::Path) -> String {
    let body = file_store_client_script(
        "\"$MLFLOW_TRACKING_URI\"",
        &WorkloadSpec::canonical(),
        "run-$$",
    );
    let path = write_client_script(dir, "good", &body).unwrap();
    format!("good={}", path.display())
}

#[test]
fn test_all_passing_exits_zero_and_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("reports/conformance.json");

    let output = Command::new(HARNESS)
        .arg("--client")
        .arg(good_client(dir.path()))
        .args(["--mode", "file", "--json"])
        .arg(&report_path)
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout: {}", stdout);
    assert!(stdout.contains("PASS good/file"));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["schema_version"], 1);
    assert_eq!(report["summary"]["passed"], 1);
    assert_eq!(report["results"][0]["client"], "good");
}

#[test]
fn test_conformance_failure_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let failing = write_client_script(dir.path(), "failing", "exit 1").unwrap();

    let output = Command::new(HARNESS)
        .arg("--client")
        .arg(good_client(dir.path()))
        .arg("--client")
        .arg(format!("failing={}", failing.display()))
        .args(["--mode", "file"])
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1), "stdout: {}", stdout);
    assert!(stdout.contains("PASS good/file"));
    assert!(stdout.contains("FAIL failing/file"));
    assert!(stdout.contains("2 combinations: 1 passed, 1 failed"));
}

#[test]
fn test_default_registry_reports_missing_clients() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(HARNESS)
        .arg("--clients-dir")
        .arg(dir.path())
        .args(["--mode", "file"])
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("FAIL go/file"));
    assert!(stdout.contains("FAIL py/file"));
}

#[test]
fn test_bad_arguments_exit_two() {
    let output = Command::new(HARNESS)
        .args(["--mode", "ftp"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));

    let output = Command::new(HARNESS)
        .args(["--client", "no-path"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
