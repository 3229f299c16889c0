use crate::model::script::{ActionKind, Selector};
use crate::model::screen::Screenshot;
use crate::model::settings::TestSettings;
use crate::model::traffic::TrafficRecord;
use crate::model::RunId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const OUTPUT_VERSION: u32 = 1;

/// Process-wide state of the run slot. At most one run is in flight at a time.
#[derive(Clone, Debug)]
pub enum RunState {
    Idle,
    Running {
        run_id: RunId,
        started_at_unix_ms: u64,
        settings: Arc<TestSettings>,
    },
    Completed(Arc<TestOutputDetails>),
    Failed(ErrorInfo),
}

impl RunState {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Errored,
}

/// Why the run stopped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ScriptCompleted,
    ScriptFailed,
    ExplorationStalled,
    ExplorationCapped,
    Timeout,
    Cancelled,
    AppCrashed,
    AppLaunchFailed,
    ScriptLoadFailed,
    InternalError,
}

/// Outcome of the scripted phase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScriptPhase {
    NotConfigured,
    Completed,
    Failed {
        step_index: usize,
        code: String,
        message: String,
    },
    Interrupted {
        next_step: usize,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub assertion_type: String,
    pub passed: bool,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Trace entry for one executed script step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub action: ActionKind,
    pub target: Option<Selector>,
    pub status: StepStatus,
    /// Target resolution attempts, including the first.
    pub attempts: u32,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub screen_before: Option<String>,
    pub screen_after: Option<String>,
    pub assertion: Option<AssertionResult>,
    pub error: Option<ErrorInfo>,
}

/// Trace entry for one action chosen by the heuristic explorer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExplorerRecord {
    /// Explorer action order within the run (1-based).
    pub sequence: u64,
    pub screen: String,
    pub fingerprint: String,
    pub action: String,
    pub element_key: Option<String>,
    pub element_text: Option<String>,
    /// Novelty rank the element had when it was chosen (higher is newer).
    pub novelty: u8,
    pub at_ms: u64,
    pub resulting_screen: Option<String>,
    pub crashed: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Script,
    Explorer,
}

/// Application crash observed while performing an action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashEvent {
    pub phase: RunPhase,
    pub screen: Option<String>,
    pub action: Option<String>,
    pub message: String,
    pub recovered: bool,
    pub at_ms: u64,
}

/// Everything the engines recorded during a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunTrace {
    pub script_steps: Vec<StepRecord>,
    pub explorer_actions: Vec<ExplorerRecord>,
    pub crashes: Vec<CrashEvent>,
    pub traffic: Vec<TrafficRecord>,
    pub screenshots: Vec<Screenshot>,
    /// Distinct screen fingerprints in first-visit order.
    pub visited_screens: Vec<String>,
}

impl RunTrace {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.script_steps.is_empty()
            && self.explorer_actions.is_empty()
            && self.crashes.is_empty()
            && self.traffic.is_empty()
            && self.screenshots.is_empty()
            && self.visited_screens.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    pub requests_observed: u64,
    pub requests_captured: u64,
    pub requests_filtered: u64,
    pub script_steps_total: usize,
    pub script_steps_executed: usize,
    pub explorer_actions: usize,
    pub actions_executed: usize,
    pub crashes: usize,
    pub screens_visited: usize,
}

/// Where the report artifacts of a run were written.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportLocation {
    pub dir: PathBuf,
    pub summary_file: PathBuf,
    pub trace_file: PathBuf,
    pub traffic_file: PathBuf,
    pub checksums_file: PathBuf,
    pub screenshots: Vec<PathBuf>,
}

/// Final artifact of a run, handed to the caller and to result listeners.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestOutputDetails {
    pub output_version: u32,
    pub run_id: RunId,
    pub status: RunStatus,
    pub success: bool,
    /// The run hit its time budget before finishing naturally.
    pub truncated: bool,
    pub end_reason: EndReason,
    pub script_phase: ScriptPhase,
    pub settings: TestSettings,
    pub started_at_unix_ms: u64,
    pub duration_ms: u64,
    pub summary: ReportSummary,
    pub report: Option<ReportLocation>,
    pub error: Option<ErrorInfo>,
    /// In-memory trace; omitted from `run.json`, persisted separately.
    #[serde(default, skip_serializing_if = "RunTrace::is_empty")]
    pub trace: RunTrace,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
}
