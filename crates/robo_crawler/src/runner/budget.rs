//! Cooperative cancellation and the run's time budget.
//!
//! Nothing here interrupts an action in progress. Phases ask [`RunBudget::should_stop`]
//! at each step or tick boundary and stop issuing new work once it answers.

use crate::runner::clock::{duration_ms, Clock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    Cancelled,
}

/// Shared flag flipped by the deadline check or by an external cancel request.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason recorded wins.
    pub fn cancel(&self, reason: StopReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }
}

/// Deadline plus cancellation token for one run.
#[derive(Clone)]
pub struct RunBudget {
    clock: Arc<dyn Clock>,
    started: Duration,
    limit: Duration,
    token: CancellationToken,
}

impl RunBudget {
    pub fn new(clock: Arc<dyn Clock>, limit: Duration, token: CancellationToken) -> Self {
        let started = clock.elapsed();
        Self {
            clock,
            started,
            limit,
            token,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed().saturating_sub(self.started)
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        duration_ms(self.elapsed())
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    /// Boundary check: trips the token when the deadline has passed and reports
    /// whether the current phase must stop.
    pub fn should_stop(&self) -> Option<StopReason> {
        if !self.token.is_cancelled() && self.remaining().is_zero() {
            self.token.cancel(StopReason::Timeout);
        }
        if self.token.is_cancelled() {
            self.token.reason()
        } else {
            None
        }
    }
}
