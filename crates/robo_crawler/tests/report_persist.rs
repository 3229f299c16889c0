// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::panic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Report artifacts written at the end of a run.

use robo_crawler::app::sim::{ScreenGraph, SimulatedLauncher};
use robo_crawler::report::{read_report, verify_checksums, CHECKSUMS_FILE, RUN_FILE};
use robo_crawler::runner::{Clock, ManualClock};
use robo_crawler::{CrawlerConfig, EndReason, NetworkInterceptor, RoboCrawler, RunStatus, TestSettings};
use std::path::Path;
use std::sync::Arc;

fn crashy_graph(fatal: bool) -> ScreenGraph {
    serde_json::from_value(serde_json::json!({
        "start": "home",
        "screens": [
            {"name": "home",
             "on_enter": [{"method": "GET", "url": "https://app.test/api/feed"}],
             "elements": [
                {"id": "settings", "text": "Settings", "kind": "button", "clickable": true,
                 "navigate_to": "settings"},
                {"id": "share", "text": "Share", "kind": "button", "clickable": true,
                 "crash": {"message": "IllegalStateException: no share target", "fatal": fatal}}
             ]},
            {"name": "settings", "elements": [
                {"id": "version", "text": "v1.2.3", "kind": "label"}
            ]}
        ]
    }))
    .unwrap()
}

fn crawler(root: &Path, fatal: bool) -> RoboCrawler {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(1_700_000_000_000));
    let interceptor = NetworkInterceptor::new();
    let launcher = SimulatedLauncher::new(crashy_graph(fatal), Arc::clone(&clock))
        .with_interceptor(interceptor.clone());
    RoboCrawler::builder(launcher)
        .config(CrawlerConfig::default().with_report_root(root))
        .clock(clock)
        .interceptor(interceptor)
        .build()
        .unwrap()
}

#[test]
fn run_writes_a_verifiable_report() {
    let dir = tempfile::tempdir().unwrap();
    let crawler = crawler(dir.path(), false);
    let result = crawler.start(TestSettings::auto(5)).unwrap();

    let location = result.report.as_ref().expect("report location");
    assert_eq!(location.dir, dir.path().join(format!("run-{}", result.run_id)));
    for file in [
        &location.summary_file,
        &location.trace_file,
        &location.traffic_file,
        &location.checksums_file,
    ] {
        assert!(file.is_file(), "missing {}", file.display());
    }
    assert!(!location.screenshots.is_empty());
    assert!(location.screenshots.iter().all(|path| path.is_file()));
    assert_eq!(result.started_at_unix_ms, 1_700_000_000_000);

    let checksums = verify_checksums(&location.dir).unwrap();
    assert!(checksums.is_ok());
    assert!(checksums.verified >= 4);

    let loaded = read_report(&location.dir).unwrap();
    assert_eq!(loaded.run_id, result.run_id);
    assert_eq!(loaded.status, result.status);
    assert_eq!(loaded.summary, result.summary);
    assert_eq!(loaded.report, result.report);
    assert_eq!(loaded.trace.explorer_actions, result.trace.explorer_actions);
    assert_eq!(loaded.trace.crashes, result.trace.crashes);
    assert_eq!(loaded.trace.traffic, result.trace.traffic);

    // No temp files are left next to the artifacts.
    let leftovers: Vec<_> = std::fs::read_dir(&location.dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn tampering_is_detected_by_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let crawler = crawler(dir.path(), false);
    let result = crawler.start(TestSettings::auto(5)).unwrap();
    let run_dir = result.report.as_ref().unwrap().dir.clone();

    std::fs::write(run_dir.join(RUN_FILE), b"{}").unwrap();
    let checksums = verify_checksums(&run_dir).unwrap();
    assert!(!checksums.is_ok());
    assert_eq!(checksums.mismatches.len(), 1);
    assert_eq!(checksums.mismatches[0].file, RUN_FILE);

    std::fs::remove_file(run_dir.join(CHECKSUMS_FILE)).unwrap();
    assert!(verify_checksums(&run_dir).is_err());
}

#[test]
fn recovered_crash_fails_the_run_and_keeps_exploring() {
    let dir = tempfile::tempdir().unwrap();
    let crawler = crawler(dir.path(), false);
    let result = crawler.start(TestSettings::auto(5)).unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(!result.success);
    assert_eq!(result.end_reason, EndReason::ExplorationStalled);
    assert_eq!(result.summary.crashes, result.trace.crashes.len());
    let crash = &result.trace.crashes[0];
    assert!(crash.recovered);
    assert!(crash.message.contains("IllegalStateException"));
    assert!(result.trace.explorer_actions.iter().any(|action| action.crashed));
    assert!(result
        .trace
        .explorer_actions
        .iter()
        .any(|action| action.resulting_screen.as_deref() == Some("settings")));
}

#[test]
fn unrecoverable_crash_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let crawler = crawler(dir.path(), true);
    let result = crawler.start(TestSettings::auto(5)).unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.end_reason, EndReason::AppCrashed);
    assert_eq!(
        result.error.as_ref().map(|e| e.code.as_str()),
        Some("E_APP_CRASH")
    );
    assert!(result.trace.crashes.iter().any(|crash| !crash.recovered));
    assert!(result.report.is_some());
}

#[test]
fn unwritable_report_root_errors_the_run_but_keeps_the_trace() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("reports");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let crawler = crawler(&blocker, false);
    let result = crawler.start(TestSettings::auto(5)).unwrap();

    assert_eq!(result.status, RunStatus::Errored);
    assert_eq!(
        result.error.as_ref().map(|e| e.code.as_str()),
        Some("E_REPORT_PERSIST")
    );
    assert!(result.report.is_none());
    assert!(!result.trace.explorer_actions.is_empty());
    assert!(!result.trace.traffic.is_empty());
    assert!(crawler.run_state().is_idle());
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
}
