// Test module - relaxed lint rules
#![allow(clippy::default_trait_access)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::panic)]
#![allow(clippy::manual_assert)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Run slot, cancellation and listener delivery.

use robo_crawler::app::{AppFault, AppUnderTest};
use robo_crawler::runner::ManualClock;
use robo_crawler::{
    CrawlerConfig, EndReason, ErrorCode, RoboCrawler, RunId, RunState, RunStatus, ScopeHandle,
    ScreenState, TestOutputDetails, TestSettings, UiAction,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// App with no actionable elements; optionally blocks on its first observation until released.
struct GateApp {
    entered: Option<Sender<()>>,
    release: Option<Receiver<()>>,
}

impl AppUnderTest for GateApp {
    fn observe(&mut self) -> Result<ScreenState, AppFault> {
        if let (Some(entered), Some(release)) = (self.entered.take(), self.release.take()) {
            // Either side may be gone when a test does not use the gate.
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(ScreenState {
            screen: "blank".to_string(),
            elements: Vec::new(),
        })
    }

    fn perform(&mut self, _action: &UiAction) -> Result<(), AppFault> {
        Ok(())
    }

    fn recover(&mut self) -> Result<(), AppFault> {
        Ok(())
    }
}

struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

fn gated_crawler(dir: &std::path::Path) -> (RoboCrawler, Gate) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let pending = Arc::new(Mutex::new(Some((entered_tx, release_rx))));
    let launcher = move |_id: RunId| -> Result<Box<dyn AppUnderTest>, AppFault> {
        let gate = pending.lock().unwrap().take();
        let (entered, release) = match gate {
            Some((entered, release)) => (Some(entered), Some(release)),
            None => (None, None),
        };
        Ok(Box::new(GateApp { entered, release }))
    };
    let crawler = RoboCrawler::builder(launcher)
        .config(CrawlerConfig::default().with_report_root(dir))
        .clock(Arc::new(ManualClock::new()))
        .build()
        .unwrap();
    (
        crawler,
        Gate {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

#[test]
fn start_while_running_is_rejected_and_leaves_run_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, gate) = gated_crawler(dir.path());

    let handle = crawler.start_async(TestSettings::auto(5)).unwrap();
    gate.entered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(crawler.is_running());

    let rejected = crawler.start(TestSettings::auto(5)).unwrap_err();
    assert_eq!(rejected.code, ErrorCode::AlreadyRunning);
    assert!(crawler.start_async(TestSettings::auto(5)).is_err());
    match crawler.run_state() {
        RunState::Running { run_id, .. } => assert_eq!(run_id, handle.run_id()),
        other => panic!("expected running state, got {other:?}"),
    }

    gate.release.send(()).unwrap();
    let first_id = handle.run_id();
    let result = handle.wait().unwrap();
    assert_eq!(result.run_id, first_id);
    assert_eq!(result.end_reason, EndReason::ExplorationStalled);
    assert!(!crawler.is_running());

    // The slot is free again.
    let second = crawler.start(TestSettings::auto(5)).unwrap();
    assert_ne!(second.run_id, first_id);
    assert_eq!(crawler.last_result().unwrap().run_id, second.run_id);
}

#[test]
fn cancel_stops_the_active_run_at_the_next_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, gate) = gated_crawler(dir.path());

    let handle = crawler.start_async(TestSettings::auto(5)).unwrap();
    gate.entered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(crawler.cancel());
    gate.release.send(()).unwrap();

    let result = handle.wait().unwrap();
    assert_eq!(result.end_reason, EndReason::Cancelled);
    assert!(!result.truncated);
    assert_eq!(result.error.as_ref().map(|e| e.code.as_str()), Some("E_CANCELLED"));
    assert!(!crawler.cancel());
}

#[tokio::test]
async fn start_async_resolves_as_a_future() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, gate) = gated_crawler(dir.path());
    let handle = crawler.start_async(TestSettings::auto(1)).unwrap();
    gate.entered.recv_timeout(Duration::from_secs(5)).unwrap();
    gate.release.send(()).unwrap();
    let result = handle.await.unwrap();
    assert_eq!(result.status, RunStatus::Passed);
    assert!(result.report.is_some());
}

#[test]
fn listener_with_inactive_scope_is_never_invoked() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, gate) = gated_crawler(dir.path());
    drop(gate);

    let active_calls = Arc::new(AtomicUsize::new(0));
    let inactive_calls = Arc::new(AtomicUsize::new(0));
    let inactive = ScopeHandle::inactive();

    let counter = Arc::clone(&active_calls);
    crawler.register_result_listener(Arc::new(ScopeHandle::active()), move |_: &TestOutputDetails| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&inactive_calls);
    crawler.register_result_listener(Arc::new(inactive.clone()), move |_: &TestOutputDetails| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    crawler.start(TestSettings::auto(1)).unwrap();
    assert!(crawler.flush_listeners(Duration::from_secs(5)));
    assert_eq!(active_calls.load(Ordering::SeqCst), 1);
    assert_eq!(inactive_calls.load(Ordering::SeqCst), 0);

    // Missed notifications are not replayed once the scope becomes active.
    inactive.activate();
    assert!(crawler.flush_listeners(Duration::from_secs(5)));
    assert_eq!(inactive_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn destroyed_scopes_are_pruned_and_panicking_listeners_are_contained() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, gate) = gated_crawler(dir.path());
    drop(gate);

    let destroyed = ScopeHandle::active();
    crawler.register_result_listener(Arc::new(destroyed.clone()), |_: &TestOutputDetails| {});
    crawler.register_result_listener(Arc::new(ScopeHandle::active()), |_: &TestOutputDetails| {
        panic!("listener failure");
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = crawler.register_result_listener(Arc::new(ScopeHandle::active()), move |_: &TestOutputDetails| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    destroyed.destroy();

    crawler.start(TestSettings::auto(1)).unwrap();
    assert!(crawler.flush_listeners(Duration::from_secs(5)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(crawler.listener_count(), 2);

    assert!(crawler.unregister_result_listener(id));
    crawler.start(TestSettings::auto(1)).unwrap();
    assert!(crawler.flush_listeners(Duration::from_secs(5)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn launch_failure_releases_the_slot_with_an_errored_result() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = |_id: RunId| -> Result<Box<dyn AppUnderTest>, AppFault> {
        Err(AppFault::Unrecoverable("package not installed".to_string()))
    };
    let crawler = RoboCrawler::new(launcher, CrawlerConfig::default().with_report_root(dir.path())).unwrap();
    let result = crawler.start(TestSettings::auto(1)).unwrap();
    assert_eq!(result.status, RunStatus::Errored);
    assert_eq!(result.end_reason, EndReason::AppLaunchFailed);
    assert_eq!(result.error.as_ref().map(|e| e.code.as_str()), Some("E_APP_LAUNCH"));
    assert!(crawler.run_state().is_idle());
}

#[test]
fn run_only_script_without_a_script_is_rejected_before_claiming_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let (crawler, _gate) = gated_crawler(dir.path());
    let settings = TestSettings {
        run_only_script: true,
        ..TestSettings::auto(1)
    };
    let err = crawler.start(settings.clone()).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidSettings);
    assert!(crawler.start_async(settings).is_err());
    assert!(crawler.run_state().is_idle());
    assert!(crawler.last_result().is_none());
}
