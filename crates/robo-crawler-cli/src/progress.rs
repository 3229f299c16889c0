//! Verbose progress output using indicatif.

use indicatif::{ProgressBar, ProgressStyle};
use robo_crawler::runner::{ProgressCallback, ProgressEvent};
use robo_crawler::{RunPhase, RunStatus, StepStatus};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Progress callback that reports steps, explorer actions and crashes on stderr.
pub struct VerboseProgress {
    spinner: Mutex<Option<ProgressBar>>,
    total_steps: Mutex<usize>,
}

impl Default for VerboseProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl VerboseProgress {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
            total_steps: Mutex::new(0),
        }
    }

    fn set_message(&self, message: String) {
        if let Ok(mut spinner) = self.spinner.lock() {
            let pb = spinner.get_or_insert_with(|| {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.enable_steady_tick(Duration::from_millis(100));
                pb
            });
            pb.set_message(message);
        }
    }

    /// Print a line without tearing the spinner.
    fn line(&self, text: &str) {
        if let Ok(spinner) = self.spinner.lock() {
            if let Some(pb) = spinner.as_ref() {
                pb.println(text);
                return;
            }
        }
        let _ = writeln!(std::io::stderr(), "{text}");
    }

    fn clear(&self) {
        if let Ok(mut spinner) = self.spinner.lock() {
            if let Some(pb) = spinner.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl ProgressCallback for VerboseProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                run_id,
                max_run_minutes,
                script_steps,
            } => {
                if let Ok(mut total) = self.total_steps.lock() {
                    *total = *script_steps;
                }
                let _ = writeln!(
                    std::io::stderr(),
                    "run started: {run_id} ({script_steps} script steps, {max_run_minutes} min budget)"
                );
            }
            ProgressEvent::PhaseChanged { phase } => match phase {
                RunPhase::Script => self.set_message("running script".to_string()),
                RunPhase::Explorer => self.set_message("exploring".to_string()),
            },
            ProgressEvent::StepCompleted {
                index,
                name,
                status,
                duration_ms,
            } => {
                let total = self.total_steps.lock().map(|g| *g).unwrap_or(0);
                let icon = match status {
                    StepStatus::Passed => "\x1b[32m✓\x1b[0m",
                    StepStatus::Failed => "\x1b[31m✗\x1b[0m",
                };
                self.line(&format!(
                    "  {icon} [{}/{total}] {name} ({duration_ms}ms)",
                    index + 1
                ));
            }
            ProgressEvent::ExplorerAction(record) => {
                let target = record
                    .element_text
                    .as_deref()
                    .or(record.element_key.as_deref())
                    .unwrap_or("-");
                self.set_message(format!(
                    "#{} {} {target} on {}",
                    record.sequence, record.action, record.screen
                ));
            }
            ProgressEvent::CrashRecorded(crash) => {
                let recovered = if crash.recovered { "recovered" } else { "fatal" };
                self.line(&format!(
                    "  \x1b[31m!\x1b[0m crash ({recovered}) on {}: {}",
                    crash.screen.as_deref().unwrap_or("?"),
                    crash.message
                ));
            }
            ProgressEvent::RunCompleted {
                status,
                duration_ms,
                ..
            } => {
                self.clear();
                let status_msg = match status {
                    RunStatus::Passed => "\x1b[32mpassed\x1b[0m",
                    RunStatus::Failed => "\x1b[31mfailed\x1b[0m",
                    RunStatus::Errored => "\x1b[31merrored\x1b[0m",
                };
                let _ = writeln!(std::io::stderr(), "run {status_msg}: {duration_ms}ms total");
            }
        }
    }
}
