//! Action script loading and execution.
//!
//! [`ScriptEngine::step`] executes exactly one [`ActionStep`] per call: resolve the target
//! on the current screen (retrying with backoff), perform the action, then check the
//! step's expected outcome. The first failing step halts the engine; later calls keep
//! returning the same failure.

use crate::app::{perform_with_recovery, ActionEffect, AppFault, AppUnderTest};
use crate::assertions;
use crate::config::{is_yaml, CrawlerConfig, ScriptEngineConfig};
use crate::model::{
    ActionKind, ActionStep, AssertionResult, CrashEvent, ErrorInfo, RoboScript, RunPhase,
    ScreenState, ScriptPhase, ScriptSource, Screenshot, StepRecord, StepStatus, UiAction,
    UiElement, SCRIPT_VERSION,
};
use crate::runner::budget::RunBudget;
use crate::runner::{CrawlerError, CrawlerResult, ErrorCode};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};
use std::time::Duration;

/// Resolve a script source into a validated script.
pub fn load_script(source: &ScriptSource, config: &CrawlerConfig) -> CrawlerResult<RoboScript> {
    let script = match source {
        ScriptSource::Inline { script } => script.clone(),
        ScriptSource::Path { path } => load_script_file(path)?,
        ScriptSource::Bundled { name } => {
            let dir = config.bundled_script_dir.as_deref().ok_or_else(|| {
                CrawlerError::new(ErrorCode::ScriptLoad, "no bundled script directory configured")
                    .with_context(serde_json::json!({ "name": name }))
            })?;
            load_script_file(&bundled_path(dir, name)?)?
        }
        ScriptSource::Remote { url } => {
            let body = fetch_remote(url, Duration::from_millis(config.remote_timeout_ms))?;
            let yaml = is_yaml(Path::new(&crate::interceptor::path_of(url)));
            parse_script(&body, yaml)?
        }
    };
    validate_script(&script)?;
    Ok(script)
}

pub fn load_script_file(path: &Path) -> CrawlerResult<RoboScript> {
    let data = fs::read_to_string(path).map_err(|err| {
        CrawlerError::script_load("failed to read script file", &err)
            .with_context(serde_json::json!({ "path": path, "source": err.to_string() }))
    })?;
    parse_script(&data, is_yaml(path))
}

pub fn parse_script(data: &str, yaml: bool) -> CrawlerResult<RoboScript> {
    if yaml {
        serde_yml::from_str(data)
            .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse yaml", err))
    } else {
        serde_json::from_str(data)
            .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse json", err))
    }
}

fn bundled_path(dir: &Path, name: &str) -> CrawlerResult<std::path::PathBuf> {
    let relative = Path::new(name);
    let plain = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(CrawlerError::new(
            ErrorCode::ScriptLoad,
            "bundled script name must be a plain relative name",
        )
        .with_context(serde_json::json!({ "name": name })));
    }
    let direct = dir.join(relative);
    if direct.is_file() {
        return Ok(direct);
    }
    ["json", "yaml", "yml"]
        .iter()
        .map(|ext| dir.join(format!("{name}.{ext}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            CrawlerError::new(ErrorCode::ScriptLoad, "bundled script not found")
                .with_context(serde_json::json!({ "name": name, "dir": dir }))
        })
}

fn fetch_remote(url: &str, timeout: Duration) -> CrawlerResult<String> {
    tracing::debug!(url, "fetching remote script");
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| CrawlerError::script_load("failed to build http client", err))?;
    client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .and_then(reqwest::blocking::Response::text)
        .map_err(|err| {
            CrawlerError::script_load("failed to fetch remote script", &err)
                .with_context(serde_json::json!({ "url": url, "source": err.to_string() }))
        })
}

/// Structural checks that do not need the app.
pub fn validate_script(script: &RoboScript) -> CrawlerResult<()> {
    if script.script_version != SCRIPT_VERSION {
        return Err(CrawlerError::protocol(format!(
            "unsupported script_version {} (expected {SCRIPT_VERSION})",
            script.script_version
        )));
    }
    for (index, step) in script.steps.iter().enumerate() {
        let name = step.display_name(index);
        if step.action.requires_target() && step.target.as_ref().map_or(true, |t| t.is_empty()) {
            return Err(CrawlerError::protocol(format!(
                "step '{name}' needs a non-empty target for '{}'",
                step.action.label()
            ))
            .with_context(serde_json::json!({ "step_index": index })));
        }
        if step.action == ActionKind::Assert && step.expect.is_none() {
            return Err(CrawlerError::protocol(format!(
                "assert step '{name}' has no expectation"
            ))
            .with_context(serde_json::json!({ "step_index": index })));
        }
    }
    Ok(())
}

/// Why the engine stopped at a step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepFailure {
    pub step_index: usize,
    pub code: ErrorCode,
    pub message: String,
    /// The app could not be recovered; no further phase can run.
    pub fatal: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Completed,
    Failed(StepFailure),
}

/// Records produced by the script phase.
#[derive(Clone, Debug, Default)]
pub struct ScriptTrace {
    pub steps: Vec<StepRecord>,
    pub crashes: Vec<CrashEvent>,
    pub screenshots: Vec<Screenshot>,
    /// Fingerprints of the screens observed, in first-seen order.
    pub visited_screens: Vec<String>,
}

pub struct ScriptEngine {
    script: RoboScript,
    config: ScriptEngineConfig,
    next: usize,
    halted: Option<StepFailure>,
    visited: HashSet<String>,
    trace: ScriptTrace,
}

/// In-progress outcome of a single step.
struct Attempt {
    attempts: u32,
    screen_before: Option<String>,
    screen_after: Option<String>,
    assertion: Option<AssertionResult>,
}

impl ScriptEngine {
    pub fn load(script: RoboScript, config: ScriptEngineConfig) -> CrawlerResult<Self> {
        validate_script(&script)?;
        Ok(Self {
            script,
            config,
            next: 0,
            halted: None,
            visited: HashSet::new(),
            trace: ScriptTrace::default(),
        })
    }

    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.script.steps.len()
    }

    /// Index of the next step to execute.
    #[must_use]
    pub fn next_step(&self) -> usize {
        self.next
    }

    #[must_use]
    pub fn script_name(&self) -> &str {
        &self.script.metadata.name
    }

    #[must_use]
    pub fn failure(&self) -> Option<&StepFailure> {
        self.halted.as_ref()
    }

    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.trace.steps
    }

    #[must_use]
    pub fn crashes(&self) -> &[CrashEvent] {
        &self.trace.crashes
    }

    /// Phase outcome as of now; a phase stopped between steps is `Interrupted`.
    #[must_use]
    pub fn phase(&self) -> ScriptPhase {
        if let Some(failure) = &self.halted {
            ScriptPhase::Failed {
                step_index: failure.step_index,
                code: failure.code.as_str().to_string(),
                message: failure.message.clone(),
            }
        } else if self.next >= self.script.steps.len() {
            ScriptPhase::Completed
        } else {
            ScriptPhase::Interrupted {
                next_step: self.next,
            }
        }
    }

    #[must_use]
    pub fn into_trace(self) -> ScriptTrace {
        self.trace
    }

    /// Execute the next step.
    pub fn step(&mut self, app: &mut dyn AppUnderTest, budget: &RunBudget) -> StepResult {
        if let Some(failure) = &self.halted {
            return StepResult::Failed(failure.clone());
        }
        let index = self.next;
        let Some(step) = self.script.steps.get(index).cloned() else {
            return StepResult::Completed;
        };
        let name = step.display_name(index);
        let started_at_ms = budget.elapsed_ms();
        tracing::debug!(step = index, name = %name, action = step.action.label(), "executing script step");

        let mut attempt = Attempt {
            attempts: 0,
            screen_before: None,
            screen_after: None,
            assertion: None,
        };
        let outcome = self.execute(app, budget, index, &step, &mut attempt);

        let (status, error) = match &outcome {
            Ok(()) => (StepStatus::Passed, None),
            Err(failure) => (
                StepStatus::Failed,
                Some(ErrorInfo {
                    code: failure.code.as_str().to_string(),
                    message: failure.message.clone(),
                    context: Some(serde_json::json!({ "step_index": index })),
                }),
            ),
        };
        self.trace.steps.push(StepRecord {
            index,
            name,
            action: step.action.clone(),
            target: step.target.clone(),
            status,
            attempts: attempt.attempts,
            started_at_ms,
            ended_at_ms: budget.elapsed_ms(),
            screen_before: attempt.screen_before,
            screen_after: attempt.screen_after,
            assertion: attempt.assertion,
            error,
        });

        match outcome {
            Ok(()) => {
                self.next += 1;
                if self.next >= self.script.steps.len() {
                    StepResult::Completed
                } else {
                    StepResult::Continue
                }
            }
            Err(failure) => {
                tracing::warn!(step = index, code = %failure.code, error = %failure.message, "script step failed");
                if !failure.fatal {
                    if let Some(shot) = app.screenshot() {
                        self.trace.screenshots.push(shot);
                    }
                }
                self.halted = Some(failure.clone());
                StepResult::Failed(failure)
            }
        }
    }

    fn execute(
        &mut self,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
        index: usize,
        step: &ActionStep,
        attempt: &mut Attempt,
    ) -> Result<(), StepFailure> {
        let action = match &step.action {
            ActionKind::Tap | ActionKind::Input { .. } => {
                let (state, element) = self.resolve_target(app, budget, index, step, attempt)?;
                attempt.screen_before = Some(state.screen);
                Some(match &step.action {
                    ActionKind::Input { text } => UiAction::Input {
                        element,
                        text: text.clone(),
                    },
                    _ => UiAction::Tap { element },
                })
            }
            ActionKind::Back => {
                attempt.attempts = 1;
                let state = self.observe(app, budget, index, None)?;
                attempt.screen_before = Some(state.screen);
                Some(UiAction::Back)
            }
            ActionKind::Wait { ms } => {
                attempt.attempts = 1;
                budget
                    .clock()
                    .sleep(Duration::from_millis(*ms).min(budget.remaining()));
                None
            }
            ActionKind::Assert => {
                attempt.attempts = 1;
                None
            }
        };

        if let Some(action) = action {
            let screen = attempt.screen_before.clone();
            match perform_with_recovery(app, &action) {
                ActionEffect::Performed => {}
                ActionEffect::CrashedRecovered(message) => {
                    self.record_crash(budget, screen, action.label(), &message, true);
                    return Err(crash_failure(index, message, false));
                }
                ActionEffect::CrashedFatal(message) => {
                    self.record_crash(budget, screen, action.label(), &message, false);
                    return Err(crash_failure(index, message, true));
                }
            }
        }

        let after = self.observe(app, budget, index, Some(step.action.label()))?;
        if attempt.screen_before.is_none() {
            attempt.screen_before = Some(after.screen.clone());
        }
        attempt.screen_after = Some(after.screen.clone());

        if let Some(expected) = &step.expect {
            let result = assertions::evaluate(&after, expected);
            let passed = result.passed;
            let message = result
                .message
                .clone()
                .unwrap_or_else(|| format!("{} did not hold", expected.label()));
            attempt.assertion = Some(result);
            if !passed {
                return Err(StepFailure {
                    step_index: index,
                    code: ErrorCode::AssertionFailed,
                    message,
                    fatal: false,
                });
            }
        }
        Ok(())
    }

    /// Observe until the selector resolves or the retry window is exhausted.
    fn resolve_target(
        &mut self,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
        index: usize,
        step: &ActionStep,
        attempt: &mut Attempt,
    ) -> Result<(ScreenState, UiElement), StepFailure> {
        let selector = step.target.clone().unwrap_or_default();
        let mut last_screen = String::new();
        for retry in 0..=self.config.target_retries {
            attempt.attempts += 1;
            let state = self.observe(app, budget, index, None)?;
            if let Some(element) = selector.resolve(&state.elements).cloned() {
                return Ok((state, element));
            }
            last_screen.clone_from(&state.screen);
            attempt.screen_before = Some(state.screen);
            if retry == self.config.target_retries || budget.should_stop().is_some() {
                break;
            }
            budget
                .clock()
                .sleep(self.config.backoff(retry).min(budget.remaining()));
        }
        Err(StepFailure {
            step_index: index,
            code: ErrorCode::TargetNotFound,
            message: format!(
                "no element matched target after {} attempts on screen '{last_screen}'",
                attempt.attempts
            ),
            fatal: false,
        })
    }

    /// Observe the current screen, recovering once if the app has crashed.
    fn observe(
        &mut self,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
        index: usize,
        action: Option<&str>,
    ) -> Result<ScreenState, StepFailure> {
        let state = match app.observe() {
            Ok(state) => state,
            Err(AppFault::Unrecoverable(message)) => {
                self.record_crash(budget, None, action.unwrap_or("observe"), &message, false);
                return Err(crash_failure(index, message, true));
            }
            Err(AppFault::Crashed(message)) => {
                let recovered = app.recover().is_ok();
                self.record_crash(budget, None, action.unwrap_or("observe"), &message, recovered);
                if !recovered {
                    return Err(crash_failure(index, message, true));
                }
                app.observe()
                    .map_err(|fault| crash_failure(index, fault.message().to_string(), true))?
            }
        };
        let fingerprint = state.fingerprint();
        if self.visited.insert(fingerprint.clone()) {
            self.trace.visited_screens.push(fingerprint);
        }
        Ok(state)
    }

    fn record_crash(
        &mut self,
        budget: &RunBudget,
        screen: Option<String>,
        action: &str,
        message: &str,
        recovered: bool,
    ) {
        tracing::warn!(screen = ?screen, action, error = message, recovered, "app crashed during script step");
        self.trace.crashes.push(CrashEvent {
            phase: RunPhase::Script,
            screen,
            action: Some(action.to_string()),
            message: message.to_string(),
            recovered,
            at_ms: budget.elapsed_ms(),
        });
    }
}

fn crash_failure(step_index: usize, message: String, fatal: bool) -> StepFailure {
    StepFailure {
        step_index,
        code: ErrorCode::AppCrash,
        message,
        fatal,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{ElementKind, ExpectedOutcome, ScriptMetadata, Selector};
    use crate::runner::budget::CancellationToken;
    use crate::runner::clock::{Clock, ManualClock};
    use std::sync::Arc;

    /// App stuck on one screen with a single button.
    struct StaticApp {
        taps: usize,
    }

    impl AppUnderTest for StaticApp {
        fn observe(&mut self) -> Result<ScreenState, AppFault> {
            Ok(ScreenState {
                screen: "home".to_string(),
                elements: vec![UiElement {
                    id: Some("ok".to_string()),
                    text: Some("OK".to_string()),
                    kind: ElementKind::Button,
                    clickable: true,
                    editable: false,
                    enabled: true,
                }],
            })
        }

        fn perform(&mut self, _action: &UiAction) -> Result<(), AppFault> {
            self.taps += 1;
            Ok(())
        }

        fn recover(&mut self) -> Result<(), AppFault> {
            Ok(())
        }
    }

    fn script(steps: Vec<ActionStep>) -> RoboScript {
        RoboScript {
            script_version: SCRIPT_VERSION,
            metadata: ScriptMetadata {
                name: "test".to_string(),
                description: None,
            },
            steps,
        }
    }

    fn tap(id: &str) -> ActionStep {
        ActionStep {
            name: None,
            target: Some(Selector::id(id)),
            action: ActionKind::Tap,
            expect: None,
        }
    }

    fn budget(clock: &Arc<ManualClock>) -> RunBudget {
        let clock: Arc<dyn Clock> = clock.clone();
        RunBudget::new(clock, Duration::from_secs(60), CancellationToken::new())
    }

    #[test]
    fn missing_target_retries_with_backoff_then_fails() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(&clock);
        let mut engine = ScriptEngine::load(script(vec![tap("missing")]), ScriptEngineConfig::default())
            .unwrap();
        let mut app = StaticApp { taps: 0 };
        let result = engine.step(&mut app, &budget);
        assert!(matches!(
            result,
            StepResult::Failed(StepFailure { code: ErrorCode::TargetNotFound, step_index: 0, .. })
        ));
        // 200 + 400 + 800 ms of backoff between four observations.
        assert_eq!(clock.elapsed(), Duration::from_millis(1_400));
        assert_eq!(engine.records().first().map(|r| r.attempts), Some(4));
        assert_eq!(app.taps, 0);
        assert_eq!(engine.step(&mut app, &budget), result);
    }

    #[test]
    fn last_passing_step_completes_the_script() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(&clock);
        let mut engine = ScriptEngine::load(script(vec![tap("ok"), tap("ok")]), ScriptEngineConfig::default())
            .unwrap();
        let mut app = StaticApp { taps: 0 };
        assert_eq!(engine.step(&mut app, &budget), StepResult::Continue);
        assert_eq!(engine.step(&mut app, &budget), StepResult::Completed);
        assert_eq!(engine.phase(), ScriptPhase::Completed);
        assert_eq!(app.taps, 2);
    }

    #[test]
    fn failed_expectation_reports_assertion_failure() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(&clock);
        let mut step = tap("ok");
        step.expect = Some(ExpectedOutcome::ScreenIs {
            screen: "detail".to_string(),
        });
        let mut engine = ScriptEngine::load(script(vec![step]), ScriptEngineConfig::default())
            .unwrap();
        let result = engine.step(&mut StaticApp { taps: 0 }, &budget);
        assert!(matches!(
            result,
            StepResult::Failed(StepFailure { code: ErrorCode::AssertionFailed, .. })
        ));
        assert!(matches!(engine.phase(), ScriptPhase::Failed { step_index: 0, .. }));
    }

    #[test]
    fn empty_script_is_completed_immediately() {
        let clock = Arc::new(ManualClock::new());
        let mut engine = ScriptEngine::load(script(Vec::new()), ScriptEngineConfig::default())
            .unwrap();
        assert_eq!(
            engine.step(&mut StaticApp { taps: 0 }, &budget(&clock)),
            StepResult::Completed
        );
    }

    #[test]
    fn tap_without_target_is_rejected() {
        let mut step = tap("ok");
        step.target = None;
        let err = validate_script(&script(vec![step])).err().map(|e| e.code);
        assert_eq!(err, Some(ErrorCode::Protocol));
    }

    #[test]
    fn bundled_names_cannot_escape_the_directory() {
        let err = bundled_path(Path::new("/tmp"), "../etc/passwd").err().map(|e| e.code);
        assert_eq!(err, Some(ErrorCode::ScriptLoad));
    }
}
