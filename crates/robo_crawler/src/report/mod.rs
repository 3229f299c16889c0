//! Report builder.
//!
//! Turns the traces collected by a run into a [`TestOutputDetails`] and persists the
//! report directory `<root>/run-<id>/`. Every artifact is written to a temporary file and
//! renamed into place, so a reader never sees a half-written file at a report path.

use crate::model::{
    EndReason, ErrorInfo, ReportLocation, ReportSummary, RunId, RunStatus, RunTrace, ScriptPhase,
    TestOutputDetails, TestSettings, TrafficCapture, TrafficRecord, OUTPUT_VERSION,
};
use crate::runner::{CrawlerError, CrawlerResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const RUN_FILE: &str = "run.json";
pub const TRACE_FILE: &str = "trace.json";
pub const TRAFFIC_FILE: &str = "traffic.json";
pub const CHECKSUMS_FILE: &str = "checksums.json";
pub const SCREENSHOTS_DIR: &str = "screenshots";

/// Everything a finished run hands to the report builder.
#[derive(Clone, Debug)]
pub struct ReportInput {
    pub run_id: RunId,
    pub settings: TestSettings,
    pub started_at_unix_ms: u64,
    pub duration_ms: u64,
    pub end_reason: EndReason,
    pub script_phase: ScriptPhase,
    pub script_steps_total: usize,
    pub truncated: bool,
    pub trace: RunTrace,
    pub capture: TrafficCapture,
    /// Run-level failure (launch, script load, internal), if any.
    pub error: Option<ErrorInfo>,
}

/// Contents of `traffic.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficDocument {
    pub observed: u64,
    pub captured: u64,
    pub filtered_out: u64,
    pub records: Vec<TrafficRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub file: String,
    pub expected: String,
    /// `None` when the file is missing.
    pub actual: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumReport {
    pub verified: usize,
    pub mismatches: Vec<ChecksumMismatch>,
}

impl ChecksumReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ReportBuilder {
    root: PathBuf,
}

impl ReportBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("run-{run_id}"))
    }

    /// Assemble the result and persist its artifacts.
    ///
    /// A persistence failure does not lose the run: the returned result is `errored` with
    /// `E_REPORT_PERSIST`, `report` is `None`, and the trace stays in memory.
    pub fn build(&self, input: ReportInput) -> TestOutputDetails {
        let ReportInput {
            run_id,
            settings,
            started_at_unix_ms,
            duration_ms,
            end_reason,
            script_phase,
            script_steps_total,
            truncated,
            mut trace,
            capture,
            error,
        } = input;

        trace.traffic = capture.records;
        let summary = summarize(&trace, capture.observed, capture.filtered_out, script_steps_total);
        let status = decide_status(end_reason, &script_phase, &trace, error.as_ref());
        let mut details = TestOutputDetails {
            output_version: OUTPUT_VERSION,
            run_id,
            status,
            success: status == RunStatus::Passed,
            truncated,
            end_reason,
            script_phase,
            settings,
            started_at_unix_ms,
            duration_ms,
            summary,
            report: None,
            error,
            trace,
        };

        let dir = self.run_dir(run_id);
        match persist(&dir, &mut details, capture.observed, capture.filtered_out) {
            Ok(location) => {
                tracing::info!(%run_id, dir = %location.dir.display(), "report persisted");
                details.report = Some(location);
            }
            Err(err) => {
                tracing::error!(%run_id, error = %err, "failed to persist report");
                let mut info = err.to_error_info();
                if let Some(previous) = details.error.take() {
                    let mut context = info.context.take().unwrap_or_else(|| serde_json::json!({}));
                    if let Some(map) = context.as_object_mut() {
                        map.insert("run_error".to_string(), serde_json::json!(previous));
                    }
                    info.context = Some(context);
                }
                details.report = None;
                details.status = RunStatus::Errored;
                details.success = false;
                details.error = Some(info);
            }
        }
        details
    }
}

fn summarize(
    trace: &RunTrace,
    observed: u64,
    filtered_out: u64,
    script_steps_total: usize,
) -> ReportSummary {
    ReportSummary {
        requests_observed: observed,
        requests_captured: trace.traffic.len() as u64,
        requests_filtered: filtered_out,
        script_steps_total,
        script_steps_executed: trace.script_steps.len(),
        explorer_actions: trace.explorer_actions.len(),
        actions_executed: trace.script_steps.len() + trace.explorer_actions.len(),
        crashes: trace.crashes.len(),
        screens_visited: trace.visited_screens.len(),
    }
}

/// Run-level failures make the run errored; a failed script or any crash makes it failed.
#[must_use]
pub fn decide_status(
    end_reason: EndReason,
    script_phase: &ScriptPhase,
    trace: &RunTrace,
    error: Option<&ErrorInfo>,
) -> RunStatus {
    let errored = matches!(
        end_reason,
        EndReason::AppLaunchFailed | EndReason::ScriptLoadFailed | EndReason::InternalError
    ) || error.is_some_and(|e| e.code == ErrorCode::ReportPersist.as_str());
    if errored {
        RunStatus::Errored
    } else if matches!(script_phase, ScriptPhase::Failed { .. })
        || !trace.crashes.is_empty()
        || end_reason == EndReason::AppCrashed
    {
        RunStatus::Failed
    } else {
        RunStatus::Passed
    }
}

fn persist(
    dir: &Path,
    details: &mut TestOutputDetails,
    observed: u64,
    filtered_out: u64,
) -> CrawlerResult<ReportLocation> {
    fs::create_dir_all(dir).map_err(|err| {
        CrawlerError::io(ErrorCode::ReportPersist, "failed to create report dir", err)
    })?;
    let mut checksums = BTreeMap::new();

    let mut screenshots = Vec::with_capacity(details.trace.screenshots.len());
    for (index, shot) in details.trace.screenshots.iter_mut().enumerate() {
        let name = format!(
            "{SCREENSHOTS_DIR}/{:06}-{}.{}",
            index + 1,
            file_safe(&shot.screen),
            file_safe(&shot.extension)
        );
        write_artifact(dir, &name, &shot.data, &mut checksums)?;
        shot.path = Some(name.clone());
        screenshots.push(dir.join(&name));
    }

    let traffic = TrafficDocument {
        observed,
        captured: details.trace.traffic.len() as u64,
        filtered_out,
        records: details.trace.traffic.clone(),
    };
    write_artifact(dir, TRAFFIC_FILE, &to_json(&traffic)?, &mut checksums)?;

    // trace.json carries everything but traffic, which has its own file.
    let records = std::mem::take(&mut details.trace.traffic);
    let trace_json = to_json(&details.trace);
    details.trace.traffic = records;
    write_artifact(dir, TRACE_FILE, &trace_json?, &mut checksums)?;

    let location = ReportLocation {
        dir: dir.to_path_buf(),
        summary_file: dir.join(RUN_FILE),
        trace_file: dir.join(TRACE_FILE),
        traffic_file: dir.join(TRAFFIC_FILE),
        checksums_file: dir.join(CHECKSUMS_FILE),
        screenshots,
    };

    details.report = Some(location.clone());
    let trace = std::mem::take(&mut details.trace);
    let run_json = to_json(&*details);
    details.trace = trace;
    details.report = None;
    write_artifact(dir, RUN_FILE, &run_json?, &mut checksums)?;

    write_atomic(&dir.join(CHECKSUMS_FILE), &to_json(&checksums)?).map_err(|err| {
        CrawlerError::io(ErrorCode::ReportPersist, "failed to write checksums", err)
    })?;
    Ok(location)
}

fn write_artifact(
    dir: &Path,
    name: &str,
    data: &[u8],
    checksums: &mut BTreeMap<String, String>,
) -> CrawlerResult<()> {
    write_atomic(&dir.join(name), data).map_err(|err| {
        CrawlerError::io(ErrorCode::ReportPersist, "failed to write artifact", &err)
            .with_context(serde_json::json!({ "artifact": name, "source": err.to_string() }))
    })?;
    checksums.insert(name.to_string(), checksum(data));
    Ok(())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> CrawlerResult<Vec<u8>> {
    serde_json::to_vec_pretty(value)
        .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to serialize", err))
}

fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "screen".to_string()
    } else {
        cleaned
    }
}

/// Write `data` to `path` via a sibling temp file and a rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(data))
}

/// Like [`write_atomic`], with the content produced by `write`. If `write` fails the temp
/// file is removed and whatever was at `path` before is left untouched.
pub fn write_atomic_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let result = (|| {
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o644);
            }
            let mut file = opts.open(&tmp_path)?;
            write(&mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Load a persisted report, including its trace and traffic when present.
pub fn read_report(dir: &Path) -> CrawlerResult<TestOutputDetails> {
    let mut details: TestOutputDetails = read_json(&dir.join(RUN_FILE), "failed to read report")?;
    let trace_path = dir.join(TRACE_FILE);
    if trace_path.exists() {
        details.trace = read_json(&trace_path, "failed to read trace")?;
    }
    let traffic_path = dir.join(TRAFFIC_FILE);
    if traffic_path.exists() {
        let traffic: TrafficDocument = read_json(&traffic_path, "failed to read traffic")?;
        details.trace.traffic = traffic.records;
    }
    Ok(details)
}

/// Recompute every checksum listed in `checksums.json`.
pub fn verify_checksums(dir: &Path) -> CrawlerResult<ChecksumReport> {
    let expected: BTreeMap<String, String> =
        read_json(&dir.join(CHECKSUMS_FILE), "failed to read checksums")?;
    let mut report = ChecksumReport::default();
    for (file, expected) in expected {
        let actual = fs::read(dir.join(&file)).ok().map(|data| checksum(&data));
        if actual.as_deref() == Some(expected.as_str()) {
            report.verified += 1;
        } else {
            report.mismatches.push(ChecksumMismatch {
                file,
                expected,
                actual,
            });
        }
    }
    Ok(report)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, message: &str) -> CrawlerResult<T> {
    let data = fs::read(path).map_err(|err| {
        CrawlerError::new(ErrorCode::Io, message)
            .with_context(serde_json::json!({ "path": path, "source": err.to_string() }))
    })?;
    serde_json::from_slice(&data)
        .map_err(|err| CrawlerError::io(ErrorCode::Protocol, message, err))
}

fn checksum(data: &[u8]) -> String {
    format!("{:016x}", fnv1a_hash(data))
}

/// 64-bit FNV-1a.
#[must_use]
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let mut hash: u64 = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrashEvent, RunPhase};

    fn input(run_id: RunId) -> ReportInput {
        ReportInput {
            run_id,
            settings: TestSettings::default(),
            started_at_unix_ms: 1_000,
            duration_ms: 42,
            end_reason: EndReason::ExplorationStalled,
            script_phase: ScriptPhase::NotConfigured,
            script_steps_total: 0,
            truncated: false,
            trace: RunTrace::default(),
            capture: TrafficCapture::default(),
            error: None,
        }
    }

    #[test]
    fn crash_makes_run_failed() {
        let mut trace = RunTrace::default();
        trace.crashes.push(CrashEvent {
            phase: RunPhase::Explorer,
            screen: Some("home".to_string()),
            action: Some("tap".to_string()),
            message: "boom".to_string(),
            recovered: true,
            at_ms: 5,
        });
        assert_eq!(
            decide_status(EndReason::Timeout, &ScriptPhase::NotConfigured, &trace, None),
            RunStatus::Failed
        );
    }

    #[test]
    fn launch_failure_is_errored() {
        assert_eq!(
            decide_status(
                EndReason::AppLaunchFailed,
                &ScriptPhase::NotConfigured,
                &RunTrace::default(),
                None
            ),
            RunStatus::Errored
        );
    }

    #[test]
    fn unwritable_root_degrades_to_errored_result() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let blocker = dir.path().join("blocker");
        assert!(fs::write(&blocker, b"not a directory").is_ok());
        let builder = ReportBuilder::new(&blocker);
        let details = builder.build(input(RunId::new()));
        assert_eq!(details.status, RunStatus::Errored);
        assert!(details.report.is_none());
        assert_eq!(
            details.error.map(|e| e.code),
            Some("E_REPORT_PERSIST".to_string())
        );
    }

    #[test]
    fn failed_write_keeps_previous_content() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let path = dir.path().join(RUN_FILE);
        assert!(write_atomic(&path, b"previous").is_ok());
        let result = write_atomic_with(&path, |file| {
            file.write_all(b"half-writ")?;
            Err(io::Error::other("simulated crash"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).ok(), Some(b"previous".to_vec()));
        assert!(!dir.path().join(".run.json.tmp").exists());
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(file_safe("com.app/Main Activity"), "com_app_Main_Activity");
        assert_eq!(file_safe(""), "screen");
    }
}
