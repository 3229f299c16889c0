//! Test run coordinator.
//!
//! [`RoboCrawler`] owns the single run slot. A run moves `Idle -> Running ->
//! Completed | Failed -> Idle`; `start` is rejected with `E_ALREADY_RUNNING` whenever the
//! slot is not idle. While running, the script phase and then the explorer phase execute
//! sequentially on one thread, checking the run's [`RunBudget`] at every step or tick
//! boundary. The interceptor's capture window is open exactly while the state is
//! `Running`.

pub mod budget;
pub mod clock;
mod error;
pub mod listeners;
pub mod progress;

pub use budget::{CancellationToken, RunBudget, StopReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CrawlerError, CrawlerResult, ErrorCode};
pub use listeners::{ListenerScope, ResultCallback, ScopeHandle};
pub use progress::{NoopProgress, ProgressCallback, ProgressEvent};

use crate::app::{AppLauncher, AppUnderTest};
use crate::config::CrawlerConfig;
use crate::explorer::{ExplorationEnd, Explorer, ExplorerTick};
use crate::interceptor::NetworkInterceptor;
use crate::model::{
    CrashEvent, EndReason, ErrorInfo, ListenerId, RunId, RunPhase, RunState, RunStatus, RunTrace,
    ScriptPhase, TestOutputDetails, TestSettings,
};
use crate::report::{ReportBuilder, ReportInput};
use crate::script::{load_script, ScriptEngine, StepFailure, StepResult};
use listeners::ListenerRegistry;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

struct Shared {
    state: Mutex<RunState>,
    last_result: Mutex<Option<Arc<TestOutputDetails>>>,
    current_token: Mutex<Option<CancellationToken>>,
    interceptor: NetworkInterceptor,
    listeners: ListenerRegistry,
    launcher: Arc<dyn AppLauncher>,
    config: CrawlerConfig,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressCallback>,
    reports: ReportBuilder,
}

/// Process-wide entry point. Cheap to clone; all clones share the same run slot.
#[derive(Clone)]
pub struct RoboCrawler {
    shared: Arc<Shared>,
}

pub struct RoboCrawlerBuilder {
    launcher: Arc<dyn AppLauncher>,
    config: CrawlerConfig,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressCallback>,
    interceptor: NetworkInterceptor,
}

impl RoboCrawlerBuilder {
    #[must_use]
    pub fn config(mut self, config: CrawlerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Use an interceptor the host has already installed in its HTTP stack.
    #[must_use]
    pub fn interceptor(mut self, interceptor: NetworkInterceptor) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn build(self) -> CrawlerResult<RoboCrawler> {
        self.config.validate()?;
        let listeners = ListenerRegistry::spawn()?;
        let reports = ReportBuilder::new(self.config.report_root.clone());
        Ok(RoboCrawler {
            shared: Arc::new(Shared {
                state: Mutex::new(RunState::Idle),
                last_result: Mutex::new(None),
                current_token: Mutex::new(None),
                interceptor: self.interceptor,
                listeners,
                launcher: self.launcher,
                config: self.config,
                clock: self.clock,
                progress: self.progress,
                reports,
            }),
        })
    }
}

/// A run that holds the slot but has not executed yet.
struct PreparedRun {
    run_id: RunId,
    settings: Arc<TestSettings>,
    token: CancellationToken,
    started_at_unix_ms: u64,
    minutes: u32,
}

impl RoboCrawler {
    pub fn builder(launcher: impl AppLauncher + 'static) -> RoboCrawlerBuilder {
        RoboCrawlerBuilder {
            launcher: Arc::new(launcher),
            config: CrawlerConfig::default(),
            clock: Arc::new(SystemClock::new()),
            progress: Arc::new(NoopProgress),
            interceptor: NetworkInterceptor::new(),
        }
    }

    pub fn new(launcher: impl AppLauncher + 'static, config: CrawlerConfig) -> CrawlerResult<Self> {
        Self::builder(launcher).config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &CrawlerConfig {
        &self.shared.config
    }

    /// Run a robo test to completion on the calling thread.
    pub fn start(&self, settings: TestSettings) -> CrawlerResult<Arc<TestOutputDetails>> {
        let run = self.shared.begin(settings)?;
        Ok(self.shared.execute(run))
    }

    /// Start a robo test on a background thread. Rejection is reported synchronously;
    /// the returned handle resolves to the result.
    pub fn start_async(&self, settings: TestSettings) -> CrawlerResult<RunHandle> {
        let run = self.shared.begin(settings)?;
        let run_id = run.run_id;
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("robo-run-{run_id}"))
            .spawn(move || {
                let details = shared.execute(run);
                let _ = tx.send(details);
            });
        if let Err(err) = spawned {
            self.shared.abandon(run_id);
            return Err(CrawlerError::io(
                ErrorCode::Internal,
                "failed to spawn run thread",
                err,
            ));
        }
        Ok(RunHandle { run_id, rx })
    }

    /// `true` from the moment a run is accepted until it has returned to idle.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.state.lock().is_idle()
    }

    #[must_use]
    pub fn run_state(&self) -> RunState {
        self.shared.state.lock().clone()
    }

    #[must_use]
    pub fn last_result(&self) -> Option<Arc<TestOutputDetails>> {
        self.shared.last_result.lock().clone()
    }

    /// Ask the active run to stop at its next step or tick boundary.
    /// Returns `false` when no run is active.
    pub fn cancel(&self) -> bool {
        match self.shared.current_token.lock().as_ref() {
            Some(token) => {
                tracing::info!("cancellation requested");
                token.cancel(StopReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Interceptor to install in the host's HTTP stack.
    #[must_use]
    pub fn network_interceptor(&self) -> NetworkInterceptor {
        self.shared.interceptor.clone()
    }

    pub fn register_result_listener<F>(&self, scope: Arc<dyn ListenerScope>, callback: F) -> ListenerId
    where
        F: Fn(&TestOutputDetails) + Send + Sync + 'static,
    {
        self.shared.listeners.register(scope, Arc::new(callback))
    }

    pub fn unregister_result_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.unregister(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Block until queued listener notifications have been delivered, or `timeout` passes.
    pub fn flush_listeners(&self, timeout: Duration) -> bool {
        self.shared.listeners.flush(timeout)
    }
}

/// Pending result of [`RoboCrawler::start_async`].
pub struct RunHandle {
    run_id: RunId,
    rx: oneshot::Receiver<Arc<TestOutputDetails>>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Block the current thread until the run finishes. Must not be called from async code;
    /// await the handle there instead.
    pub fn wait(self) -> CrawlerResult<Arc<TestOutputDetails>> {
        self.rx.blocking_recv().map_err(|_| lost_run())
    }
}

impl Future for RunHandle {
    type Output = CrawlerResult<Arc<TestOutputDetails>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| lost_run()))
    }
}

fn lost_run() -> CrawlerError {
    CrawlerError::internal("run thread ended without producing a result")
}

/// What the phases produced, before traffic is drained and the report is built.
struct RunOutcome {
    end_reason: EndReason,
    script_phase: ScriptPhase,
    script_steps_total: usize,
    truncated: bool,
    trace: RunTrace,
    error: Option<ErrorInfo>,
}

impl RunOutcome {
    fn errored(end_reason: EndReason, error: &CrawlerError) -> Self {
        Self {
            end_reason,
            script_phase: ScriptPhase::NotConfigured,
            script_steps_total: 0,
            truncated: false,
            trace: RunTrace::default(),
            error: Some(error.to_error_info()),
        }
    }
}

impl Shared {
    /// Claim the run slot and open the capture window.
    fn begin(&self, settings: TestSettings) -> CrawlerResult<PreparedRun> {
        settings.validate()?;
        let mut state = self.state.lock();
        if !state.is_idle() {
            let context = match &*state {
                RunState::Running { run_id, .. } => {
                    Some(serde_json::json!({ "active_run_id": run_id }))
                }
                _ => None,
            };
            tracing::warn!("start rejected: a robo test is already running");
            return Err(CrawlerError::already_running(context));
        }
        let run_id = RunId::new();
        let minutes = settings.effective_run_minutes(self.config.max_run_minutes_ceiling);
        if minutes != settings.max_run_minutes {
            tracing::debug!(requested = settings.max_run_minutes, minutes, "run length clamped");
        }
        let started_at_unix_ms = self.clock.unix_ms();
        let token = CancellationToken::new();
        let settings = Arc::new(settings);
        self.interceptor
            .open_window(settings.request_filter.clone(), Arc::clone(&self.clock));
        *self.current_token.lock() = Some(token.clone());
        *state = RunState::Running {
            run_id,
            started_at_unix_ms,
            settings: Arc::clone(&settings),
        };
        tracing::info!(%run_id, minutes, scripted = settings.script.is_some(), "robo test started");
        Ok(PreparedRun {
            run_id,
            settings,
            token,
            started_at_unix_ms,
            minutes,
        })
    }

    /// Release a slot claimed by `begin` for a run that never executed.
    fn abandon(&self, run_id: RunId) {
        let _ = self.interceptor.drain_records();
        *self.current_token.lock() = None;
        *self.state.lock() = RunState::Idle;
        tracing::error!(%run_id, "run abandoned before it started");
    }

    fn execute(&self, run: PreparedRun) -> Arc<TestOutputDetails> {
        let started = self.clock.elapsed();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.drive(&run))).unwrap_or_else(|_| {
            tracing::error!(run_id = %run.run_id, "robo test panicked");
            RunOutcome::errored(
                EndReason::InternalError,
                &CrawlerError::internal("robo test panicked"),
            )
        });

        // Closing the window here keeps capture coincident with the Running state.
        let capture = self.interceptor.drain_records();
        let duration_ms = clock::duration_ms(self.clock.elapsed().saturating_sub(started));
        let details = Arc::new(self.reports.build(ReportInput {
            run_id: run.run_id,
            settings: (*run.settings).clone(),
            started_at_unix_ms: run.started_at_unix_ms,
            duration_ms,
            end_reason: outcome.end_reason,
            script_phase: outcome.script_phase,
            script_steps_total: outcome.script_steps_total,
            truncated: outcome.truncated,
            trace: outcome.trace,
            capture,
            error: outcome.error,
        }));

        *self.state.lock() = match (&details.status, &details.error) {
            (RunStatus::Errored, Some(error)) => RunState::Failed(error.clone()),
            _ => RunState::Completed(Arc::clone(&details)),
        };
        *self.last_result.lock() = Some(Arc::clone(&details));
        *self.current_token.lock() = None;
        tracing::info!(
            run_id = %details.run_id,
            status = ?details.status,
            end_reason = ?details.end_reason,
            duration_ms,
            "robo test finished"
        );
        self.progress.on_progress(&ProgressEvent::RunCompleted {
            run_id: details.run_id,
            status: details.status,
            end_reason: details.end_reason,
            duration_ms,
        });
        self.listeners.notify(Arc::clone(&details));
        *self.state.lock() = RunState::Idle;
        details
    }

    fn drive(&self, run: &PreparedRun) -> RunOutcome {
        let limit = Duration::from_secs(u64::from(run.minutes) * 60);
        let budget = RunBudget::new(Arc::clone(&self.clock), limit, run.token.clone());

        let mut engine = match &run.settings.script {
            None => None,
            Some(source) => {
                match load_script(source, &self.config)
                    .and_then(|script| ScriptEngine::load(script, self.config.script.clone()))
                {
                    Ok(engine) => Some(engine),
                    Err(err) => {
                        tracing::error!(run_id = %run.run_id, source = %source.describe(), error = %err, "failed to load script");
                        return RunOutcome::errored(EndReason::ScriptLoadFailed, &err);
                    }
                }
            }
        };

        self.progress.on_progress(&ProgressEvent::RunStarted {
            run_id: run.run_id,
            max_run_minutes: run.minutes,
            script_steps: engine.as_ref().map_or(0, ScriptEngine::total_steps),
        });

        let mut app = match self.launcher.launch(run.run_id) {
            Ok(app) => app,
            Err(fault) => {
                tracing::error!(run_id = %run.run_id, error = %fault, "failed to launch app");
                return RunOutcome::errored(
                    EndReason::AppLaunchFailed,
                    &CrawlerError::new(ErrorCode::AppLaunch, fault.to_string()),
                );
            }
        };

        let mut trace = RunTrace::default();
        let mut stop = None;
        let mut script_failure = None;
        let (script_phase, script_steps_total) = match engine.as_mut() {
            Some(engine) => {
                let (halt, failure) = self.run_script(engine, app.as_mut(), &budget);
                stop = halt;
                script_failure = failure;
                (engine.phase(), engine.total_steps())
            }
            None => (ScriptPhase::NotConfigured, 0),
        };
        if let Some(engine) = engine {
            let script_trace = engine.into_trace();
            trace.script_steps = script_trace.steps;
            trace.crashes = script_trace.crashes;
            trace.screenshots = script_trace.screenshots;
            trace.visited_screens = script_trace.visited_screens;
        }

        let fatal_script_failure = script_failure.as_ref().is_some_and(|f| f.fatal);
        let mut exploration = None;
        if stop.is_none() && !run.settings.run_only_script && !fatal_script_failure {
            let (halt, end) = self.run_explorer(app.as_mut(), &budget, &mut trace);
            stop = halt;
            exploration = end;
        }

        let (end_reason, error) = decide_end(
            stop,
            script_failure.as_ref(),
            exploration,
            run.settings.run_only_script,
        );
        RunOutcome {
            end_reason,
            script_phase,
            script_steps_total,
            truncated: stop == Some(StopReason::Timeout),
            trace,
            error,
        }
    }

    fn run_script(
        &self,
        engine: &mut ScriptEngine,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
    ) -> (Option<StopReason>, Option<StepFailure>) {
        self.progress.on_progress(&ProgressEvent::PhaseChanged {
            phase: RunPhase::Script,
        });
        tracing::info!(script = engine.script_name(), steps = engine.total_steps(), "script phase started");
        loop {
            if let Some(reason) = budget.should_stop() {
                tracing::info!(?reason, next_step = engine.next_step(), "script phase stopped");
                return (Some(reason), None);
            }
            let crashes_before = engine.crashes().len();
            let result = engine.step(app, budget);
            self.report_crashes(engine.crashes().get(crashes_before..).unwrap_or_default());
            if let Some(record) = engine.records().last() {
                self.progress.on_progress(&ProgressEvent::StepCompleted {
                    index: record.index,
                    name: record.name.clone(),
                    status: record.status,
                    duration_ms: record.ended_at_ms.saturating_sub(record.started_at_ms),
                });
            }
            match result {
                StepResult::Continue => {}
                StepResult::Completed => return (None, None),
                StepResult::Failed(failure) => return (None, Some(failure)),
            }
        }
    }

    fn run_explorer(
        &self,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
        trace: &mut RunTrace,
    ) -> (Option<StopReason>, Option<ExplorationEnd>) {
        self.progress.on_progress(&ProgressEvent::PhaseChanged {
            phase: RunPhase::Explorer,
        });
        tracing::info!("explorer phase started");
        let mut explorer = Explorer::with_visited(
            self.config.explorer.clone(),
            std::mem::take(&mut trace.visited_screens),
        );
        let outcome = loop {
            if let Some(reason) = budget.should_stop() {
                break (Some(reason), None);
            }
            let crashes_before = explorer.crashes().len();
            let tick = explorer.tick(app, budget);
            self.report_crashes(explorer.crashes().get(crashes_before..).unwrap_or_default());
            match tick {
                ExplorerTick::ActionTaken(record) => {
                    self.progress.on_progress(&ProgressEvent::ExplorerAction(record));
                }
                ExplorerTick::Idle => {}
                ExplorerTick::Finished(ExplorationEnd::BudgetExhausted) => {
                    budget.token().cancel(StopReason::Timeout);
                    break (budget.token().reason(), None);
                }
                ExplorerTick::Finished(end) => break (None, Some(end)),
            }
        };
        tracing::info!(
            actions = explorer.actions_taken(),
            screens = explorer.visited_screens().len(),
            "explorer phase finished"
        );
        let explored = explorer.into_trace();
        trace.explorer_actions = explored.actions;
        trace.crashes.extend(explored.crashes);
        trace.screenshots.extend(explored.screenshots);
        trace.visited_screens = explored.visited_screens;
        outcome
    }

    fn report_crashes(&self, crashes: &[CrashEvent]) {
        for crash in crashes {
            self.progress
                .on_progress(&ProgressEvent::CrashRecorded(crash.clone()));
        }
    }
}

/// Map how the phases stopped to the run's end reason and run-level error.
fn decide_end(
    stop: Option<StopReason>,
    script_failure: Option<&StepFailure>,
    exploration: Option<ExplorationEnd>,
    run_only_script: bool,
) -> (EndReason, Option<ErrorInfo>) {
    match stop {
        Some(StopReason::Timeout) => return (EndReason::Timeout, None),
        Some(StopReason::Cancelled) => {
            let error = CrawlerError::new(ErrorCode::Cancelled, "run cancelled");
            return (EndReason::Cancelled, Some(error.to_error_info()));
        }
        None => {}
    }
    if let Some(failure) = script_failure.filter(|f| f.fatal) {
        let error = CrawlerError::new(ErrorCode::AppCrash, failure.message.clone());
        return (EndReason::AppCrashed, Some(error.to_error_info()));
    }
    match exploration {
        Some(ExplorationEnd::Stalled) => (EndReason::ExplorationStalled, None),
        Some(ExplorationEnd::Capped) => (EndReason::ExplorationCapped, None),
        Some(ExplorationEnd::AppCrashed) => {
            let error = CrawlerError::new(ErrorCode::AppCrash, "app crashed and could not recover");
            (EndReason::AppCrashed, Some(error.to_error_info()))
        }
        Some(ExplorationEnd::BudgetExhausted) => (EndReason::Timeout, None),
        None if script_failure.is_some() && run_only_script => (EndReason::ScriptFailed, None),
        None => (EndReason::ScriptCompleted, None),
    }
}
