//! Progress callback for reporting run progress.
//!
//! This module provides a trait for receiving progress events while a robo test runs.

use crate::model::{
    CrashEvent, EndReason, ExplorerRecord, RunId, RunPhase, RunStatus, StepStatus,
};

/// Event emitted during a run for progress tracking.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Run has started.
    RunStarted {
        /// Unique run identifier.
        run_id: RunId,
        /// Effective run length after clamping.
        max_run_minutes: u32,
        /// Number of script steps, zero for an unscripted run.
        script_steps: usize,
    },
    /// The run moved to another phase.
    PhaseChanged {
        /// Phase now active.
        phase: RunPhase,
    },
    /// A script step has finished.
    StepCompleted {
        /// Step index (0-based).
        index: usize,
        /// Step name.
        name: String,
        /// Final status.
        status: StepStatus,
        /// Duration in milliseconds.
        duration_ms: u64,
    },
    /// The explorer performed an action.
    ExplorerAction(ExplorerRecord),
    /// The app crashed.
    CrashRecorded(CrashEvent),
    /// Run has completed and its report was built.
    RunCompleted {
        /// Unique run identifier.
        run_id: RunId,
        /// Final status.
        status: RunStatus,
        /// Why the run stopped.
        end_reason: EndReason,
        /// Total duration in milliseconds.
        duration_ms: u64,
    },
}

/// Trait for receiving progress events during execution.
///
/// Events are delivered on the run's thread, so implementors should return quickly.
pub trait ProgressCallback: Send + Sync {
    /// Called for each progress event.
    fn on_progress(&self, event: &ProgressEvent);
}

/// A no-op progress callback that discards all events.
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// A progress callback that collects events for testing.
#[cfg(test)]
#[derive(Default)]
pub struct CollectingProgress {
    events: parking_lot::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl CollectingProgress {
    /// Create a new collecting progress callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl ProgressCallback for CollectingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}
