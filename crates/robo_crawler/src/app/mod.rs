//! Seam between the engines and the application under test.
//!
//! How screens are observed and actions delivered is platform specific. The engines only
//! see [`AppUnderTest`]: observe the current screen, perform an action, recover after a
//! crash, and optionally capture a screenshot.

pub mod sim;

use crate::model::{RunId, ScreenState, Screenshot, UiAction};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppFault {
    /// The app crashed or threw an unhandled exception; `recover` may bring it back.
    #[error("application crashed: {0}")]
    Crashed(String),
    /// The app cannot be driven any further in this run.
    #[error("application cannot recover: {0}")]
    Unrecoverable(String),
}

impl AppFault {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Crashed(message) | Self::Unrecoverable(message) => message,
        }
    }
}

pub trait AppUnderTest: Send {
    /// Current screen, once it is stable.
    fn observe(&mut self) -> Result<ScreenState, AppFault>;

    fn perform(&mut self, action: &UiAction) -> Result<(), AppFault>;

    /// Bring the app back to a stable screen after a crash.
    fn recover(&mut self) -> Result<(), AppFault>;

    fn screenshot(&mut self) -> Option<Screenshot> {
        None
    }
}

/// Starts a fresh instance of the app for each run.
pub trait AppLauncher: Send + Sync {
    fn launch(&self, run_id: RunId) -> Result<Box<dyn AppUnderTest>, AppFault>;
}

impl<F> AppLauncher for F
where
    F: Fn(RunId) -> Result<Box<dyn AppUnderTest>, AppFault> + Send + Sync,
{
    fn launch(&self, run_id: RunId) -> Result<Box<dyn AppUnderTest>, AppFault> {
        self(run_id)
    }
}

/// Result of performing an action and trying to get back to a usable state afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActionEffect {
    Performed,
    /// Crashed, then recovered to a stable screen.
    CrashedRecovered(String),
    /// Crashed and could not be recovered.
    CrashedFatal(String),
}

/// Perform an action, translating crashes into recovery attempts.
pub(crate) fn perform_with_recovery(app: &mut dyn AppUnderTest, action: &UiAction) -> ActionEffect {
    match app.perform(action) {
        Ok(()) => ActionEffect::Performed,
        Err(AppFault::Unrecoverable(message)) => ActionEffect::CrashedFatal(message),
        Err(AppFault::Crashed(message)) => match app.recover() {
            Ok(()) => ActionEffect::CrashedRecovered(message),
            Err(fault) => {
                tracing::warn!(error = %fault, "app did not recover after crash");
                ActionEffect::CrashedFatal(message)
            }
        },
    }
}
