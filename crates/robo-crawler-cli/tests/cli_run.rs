// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::panic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

use robo_crawler::{EndReason, ErrorInfo, HttpMethod, RunStatus, TestOutputDetails};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn robo_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_robo-crawler"))
}

fn shop_model(crash: bool) -> serde_json::Value {
    let mut checkout = serde_json::json!({
        "id": "checkout", "text": "Checkout", "kind": "button", "clickable": true,
        "requests": [{"method": "POST", "url": "https://shop.test/api/orders", "status": 201}]
    });
    if crash {
        checkout["crash"] = serde_json::json!({"message": "checkout exploded"});
    }
    serde_json::json!({
        "start": "catalog",
        "screens": [
            {"name": "catalog",
             "on_enter": [{"method": "GET", "url": "https://shop.test/api/items"}],
             "elements": [
                {"id": "login", "text": "Sign in", "kind": "button", "clickable": true,
                 "requests": [{"method": "POST", "url": "https://shop.test/api/login"}]},
                {"id": "cart", "text": "Cart", "kind": "button", "clickable": true,
                 "navigate_to": "cart"}
             ]},
            {"name": "cart", "elements": [checkout]}
        ]
    })
}

fn write_model(dir: &Path, crash: bool) -> PathBuf {
    let path = dir.join("app.yaml");
    fs::write(&path, serde_yml::to_string(&shop_model(crash)).unwrap()).unwrap();
    path
}

fn run_json(args: &[&str]) -> (Output, Option<TestOutputDetails>) {
    let output = robo_bin().arg("run").args(args).arg("--json").output().expect("failed to execute");
    let details = serde_json::from_slice(&output.stdout).ok();
    (output, details)
}

#[test]
fn unscripted_run_passes_and_writes_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_model(dir.path(), false);
    let reports = dir.path().join("reports");

    let (output, details) = run_json(&[
        "--app",
        app.to_str().unwrap(),
        "--reports",
        reports.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "run should pass: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let details = details.expect("run result on stdout");
    assert_eq!(details.status, RunStatus::Passed);
    assert_eq!(details.end_reason, EndReason::ExplorationStalled);
    let report = details.report.expect("report location");
    assert!(report.summary_file.is_file());
    assert!(report.dir.starts_with(&reports));
}

#[test]
fn crash_makes_the_run_fail_with_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_model(dir.path(), true);
    let reports = dir.path().join("reports");

    let (output, details) = run_json(&[
        "--app",
        app.to_str().unwrap(),
        "--reports",
        reports.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    let details = details.unwrap();
    assert_eq!(details.status, RunStatus::Failed);
    assert!(details.summary.crashes >= 1);
}

#[test]
fn method_filter_flags_limit_captured_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_model(dir.path(), false);
    let reports = dir.path().join("reports");

    let (output, details) = run_json(&[
        "--app",
        app.to_str().unwrap(),
        "--reports",
        reports.to_str().unwrap(),
        "--method",
        "get",
        "--always-path",
        "/login",
    ]);
    assert!(output.status.success());
    let details = details.unwrap();
    let report = details.report.unwrap();
    let traffic: serde_json::Value =
        serde_json::from_slice(&fs::read(report.traffic_file).unwrap()).unwrap();
    let records = traffic["records"].as_array().unwrap();
    assert!(!records.is_empty());
    for record in records {
        let method: HttpMethod = serde_json::from_value(record["method"].clone()).unwrap();
        let path = record["path"].as_str().unwrap();
        assert!(method == HttpMethod::Get || path.contains("/login"), "unexpected {method} {path}");
    }
    assert!(details.summary.requests_filtered >= 1);
}

#[test]
fn failing_script_only_run_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_model(dir.path(), false);
    let script = dir.path().join("script.json");
    fs::write(
        &script,
        serde_json::to_vec(&serde_json::json!({
            "script_version": 1,
            "metadata": {"name": "checkout"},
            "steps": [
                {"target": {"id": "cart"}, "action": {"type": "tap"}},
                {"target": {"id": "pay"}, "action": {"type": "tap"}}
            ]
        }))
        .unwrap(),
    )
    .unwrap();

    let (output, details) = run_json(&[
        "--app",
        app.to_str().unwrap(),
        "--reports",
        dir.path().join("reports").to_str().unwrap(),
        "--script",
        script.to_str().unwrap(),
        "--run-only-script",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let details = details.unwrap();
    assert_eq!(details.end_reason, EndReason::ScriptFailed);
    assert_eq!(details.summary.explorer_actions, 0);
}

#[test]
fn missing_app_model_reports_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = robo_bin()
        .arg("run")
        .arg("--app")
        .arg(dir.path().join("absent.json"))
        .arg("--json")
        .output()
        .expect("failed to execute");
    assert_eq!(output.status.code(), Some(11));
    let error: ErrorInfo = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(error.code, "E_IO");
}

#[test]
fn run_only_script_requires_a_script_source() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_model(dir.path(), false);
    let output = robo_bin()
        .arg("run")
        .arg("--app")
        .arg(app)
        .arg("--run-only-script")
        .output()
        .expect("failed to execute");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--script"));
}

#[test]
fn script_sources_are_mutually_exclusive() {
    let output = robo_bin()
        .args(["run", "--app", "a.json", "--script", "s.json", "--bundled", "smoke"])
        .output()
        .expect("failed to execute");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot be used with"));
}
