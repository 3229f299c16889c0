//! Heuristic explorer.
//!
//! Each [`Explorer::tick`] observes the current screen, ranks its actionable elements by
//! novelty and performs the top-ranked action. Novelty ranks, highest first:
//!
//! - `2`: the element has never been acted on from this screen,
//! - `1`: acting on it previously led to a screen that still has untried elements,
//! - `0`: everything else.
//!
//! Ties go to the element with fewer attempts, then to document order. Ticks that find
//! nothing new (no actionable element, or only rank-0 elements that lead to no new screen)
//! are stale; `stall_threshold` stale ticks in a row end exploration as stalled.

use crate::app::{perform_with_recovery, ActionEffect, AppFault, AppUnderTest};
use crate::config::ExplorerConfig;
use crate::model::{
    CrashEvent, ExplorerRecord, RunPhase, ScreenState, Screenshot, UiAction, UiElement,
};
use crate::runner::budget::RunBudget;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExplorationEnd {
    /// No new actionable state for `stall_threshold` consecutive ticks.
    Stalled,
    /// `max_actions` reached.
    Capped,
    /// The time budget is used up.
    BudgetExhausted,
    /// The app crashed and could not be recovered.
    AppCrashed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExplorerTick {
    ActionTaken(ExplorerRecord),
    /// Nothing actionable on the current screen; the explorer pressed back instead.
    Idle,
    Finished(ExplorationEnd),
}

/// Records produced by the explorer phase.
#[derive(Clone, Debug, Default)]
pub struct ExplorerTrace {
    pub actions: Vec<ExplorerRecord>,
    pub crashes: Vec<CrashEvent>,
    pub screenshots: Vec<Screenshot>,
    pub visited_screens: Vec<String>,
}

type ElementRef = (String, String);

pub struct Explorer {
    config: ExplorerConfig,
    visited: HashSet<String>,
    /// Actionable element keys per screen fingerprint.
    screens: HashMap<String, Vec<String>>,
    attempts: HashMap<ElementRef, u32>,
    transitions: HashMap<ElementRef, String>,
    stale_ticks: u32,
    finished: Option<ExplorationEnd>,
    trace: ExplorerTrace,
}

struct Candidate {
    position: usize,
    key: String,
    element: UiElement,
    novelty: u8,
    attempts: u32,
}

impl Explorer {
    pub fn new(config: ExplorerConfig) -> Self {
        Self {
            config,
            visited: HashSet::new(),
            screens: HashMap::new(),
            attempts: HashMap::new(),
            transitions: HashMap::new(),
            stale_ticks: 0,
            finished: None,
            trace: ExplorerTrace::default(),
        }
    }

    /// Explorer that treats `screens` (fingerprints reached earlier in the run) as
    /// already visited.
    pub fn with_visited(config: ExplorerConfig, screens: impl IntoIterator<Item = String>) -> Self {
        let mut explorer = Self::new(config);
        for fingerprint in screens {
            if explorer.visited.insert(fingerprint.clone()) {
                explorer.trace.visited_screens.push(fingerprint);
            }
        }
        explorer
    }

    #[must_use]
    pub fn actions_taken(&self) -> usize {
        self.trace.actions.len()
    }

    #[must_use]
    pub fn crashes(&self) -> &[CrashEvent] {
        &self.trace.crashes
    }

    #[must_use]
    pub fn visited_screens(&self) -> &[String] {
        &self.trace.visited_screens
    }

    #[must_use]
    pub fn into_trace(self) -> ExplorerTrace {
        self.trace
    }

    pub fn tick(&mut self, app: &mut dyn AppUnderTest, budget: &RunBudget) -> ExplorerTick {
        if let Some(end) = self.finished {
            return ExplorerTick::Finished(end);
        }
        if budget.remaining().is_zero() {
            return self.finish(ExplorationEnd::BudgetExhausted);
        }
        if self
            .config
            .max_actions
            .is_some_and(|max| self.trace.actions.len() as u64 >= max)
        {
            return self.finish(ExplorationEnd::Capped);
        }

        let Some(state) = self.observe(app, budget, None, "observe") else {
            return self.finish(ExplorationEnd::AppCrashed);
        };
        let fingerprint = state.fingerprint();
        self.visit(app, &state, &fingerprint);

        let Some(candidate) = self.best_candidate(&state, &fingerprint) else {
            if let ActionEffect::CrashedFatal(message) = perform_with_recovery(app, &UiAction::Back)
            {
                self.record_crash(budget, Some(state.screen), "back", &message, false);
                return self.finish(ExplorationEnd::AppCrashed);
            }
            return self.stale_tick(ExplorerTick::Idle);
        };

        let action = if candidate.element.editable {
            UiAction::Input {
                element: candidate.element.clone(),
                text: self.config.input_text.clone(),
            }
        } else {
            UiAction::Tap {
                element: candidate.element.clone(),
            }
        };
        let element_ref = (fingerprint.clone(), candidate.key.clone());
        *self.attempts.entry(element_ref.clone()).or_insert(0) += 1;
        tracing::debug!(
            screen = %state.screen,
            element = %candidate.key,
            novelty = candidate.novelty,
            "explorer action"
        );

        let effect = perform_with_recovery(app, &action);
        let mut record = ExplorerRecord {
            sequence: self.trace.actions.len() as u64 + 1,
            screen: state.screen.clone(),
            fingerprint,
            action: action.label().to_string(),
            element_key: Some(candidate.key.clone()),
            element_text: candidate.element.text.clone(),
            novelty: candidate.novelty,
            at_ms: budget.elapsed_ms(),
            resulting_screen: None,
            crashed: false,
        };

        let mut discovered = false;
        match effect {
            ActionEffect::Performed => {
                let crashes_before = self.trace.crashes.len();
                let next = self.observe(app, budget, Some(state.screen.clone()), action.label());
                record.crashed = self.trace.crashes.len() > crashes_before;
                let Some(next) = next else {
                    self.trace.actions.push(record);
                    return self.finish(ExplorationEnd::AppCrashed);
                };
                let next_fingerprint = next.fingerprint();
                discovered = self.visit(app, &next, &next_fingerprint);
                if !record.crashed {
                    self.transitions.insert(element_ref, next_fingerprint);
                }
                record.resulting_screen = Some(next.screen);
            }
            ActionEffect::CrashedRecovered(message) => {
                record.crashed = true;
                self.record_crash(budget, Some(state.screen), action.label(), &message, true);
            }
            ActionEffect::CrashedFatal(message) => {
                record.crashed = true;
                self.record_crash(budget, Some(state.screen), action.label(), &message, false);
                self.trace.actions.push(record);
                return self.finish(ExplorationEnd::AppCrashed);
            }
        }

        self.trace.actions.push(record.clone());
        if candidate.novelty > 0 || discovered {
            self.stale_ticks = 0;
            ExplorerTick::ActionTaken(record)
        } else {
            self.stale_tick(ExplorerTick::ActionTaken(record))
        }
    }

    fn stale_tick(&mut self, tick: ExplorerTick) -> ExplorerTick {
        self.stale_ticks += 1;
        if self.stale_ticks >= self.config.stall_threshold {
            tracing::info!(ticks = self.stale_ticks, "exploration stalled");
            self.finished = Some(ExplorationEnd::Stalled);
        }
        tick
    }

    fn finish(&mut self, end: ExplorationEnd) -> ExplorerTick {
        self.finished = Some(end);
        ExplorerTick::Finished(end)
    }

    /// Observe the current screen, relaunching once after a recoverable crash. A crash is
    /// attributed to `action` on `screen`, the last thing the explorer did.
    fn observe(
        &mut self,
        app: &mut dyn AppUnderTest,
        budget: &RunBudget,
        screen: Option<String>,
        action: &str,
    ) -> Option<ScreenState> {
        match app.observe() {
            Ok(state) => Some(state),
            Err(AppFault::Unrecoverable(message)) => {
                self.record_crash(budget, screen, action, &message, false);
                None
            }
            Err(AppFault::Crashed(message)) => {
                let recovered = app.recover().is_ok();
                self.record_crash(budget, screen, action, &message, recovered);
                if recovered {
                    app.observe().ok()
                } else {
                    None
                }
            }
        }
    }

    /// Register a screen; returns `true` when it had not been seen before.
    fn visit(&mut self, app: &mut dyn AppUnderTest, state: &ScreenState, fingerprint: &str) -> bool {
        self.screens.entry(fingerprint.to_string()).or_insert_with(|| {
            state
                .keyed_actionable()
                .into_iter()
                .map(|(_, key, _)| key)
                .collect()
        });
        if !self.visited.insert(fingerprint.to_string()) {
            return false;
        }
        tracing::debug!(screen = %state.screen, fingerprint, "new screen discovered");
        self.trace.visited_screens.push(fingerprint.to_string());
        if self.config.screenshot_new_screens {
            if let Some(shot) = app.screenshot() {
                self.trace.screenshots.push(shot);
            }
        }
        true
    }

    fn has_untried(&self, fingerprint: &str) -> bool {
        self.screens.get(fingerprint).is_some_and(|keys| {
            keys.iter().any(|key| {
                !self
                    .attempts
                    .contains_key(&(fingerprint.to_string(), key.clone()))
            })
        })
    }

    fn best_candidate(&self, state: &ScreenState, fingerprint: &str) -> Option<Candidate> {
        state
            .keyed_actionable()
            .into_iter()
            .map(|(position, key, element)| {
                let element_ref = (fingerprint.to_string(), key.clone());
                let attempts = self.attempts.get(&element_ref).copied().unwrap_or(0);
                let novelty = if attempts == 0 {
                    2
                } else if self
                    .transitions
                    .get(&element_ref)
                    .is_some_and(|dest| dest != fingerprint && self.has_untried(dest))
                {
                    1
                } else {
                    0
                };
                Candidate {
                    position,
                    key,
                    element: element.clone(),
                    novelty,
                    attempts,
                }
            })
            .min_by_key(|c| (Reverse(c.novelty), c.attempts, c.position))
    }

    fn record_crash(
        &mut self,
        budget: &RunBudget,
        screen: Option<String>,
        action: &str,
        message: &str,
        recovered: bool,
    ) {
        tracing::warn!(screen = ?screen, action, error = message, recovered, "app crashed during exploration");
        self.trace.crashes.push(CrashEvent {
            phase: RunPhase::Explorer,
            screen,
            action: Some(action.to_string()),
            message: message.to_string(),
            recovered,
            at_ms: budget.elapsed_ms(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::app::sim::{ScreenGraph, SimulatedApp};
    use crate::runner::budget::CancellationToken;
    use crate::runner::clock::{Clock, ManualClock};
    use std::sync::Arc;
    use std::time::Duration;

    fn graph() -> ScreenGraph {
        serde_json::from_value(serde_json::json!({
            "start": "home",
            "screens": [
                {"name": "home", "elements": [
                    {"id": "a", "text": "A", "kind": "button", "clickable": true, "navigate_to": "a"},
                    {"id": "b", "text": "B", "kind": "button", "clickable": true, "navigate_to": "b"}
                ]},
                {"name": "a", "elements": [
                    {"id": "home", "text": "Home", "kind": "button", "clickable": true, "navigate_to": "home"}
                ]},
                {"name": "b", "elements": [
                    {"id": "info", "text": "Info", "kind": "label"}
                ]}
            ]
        }))
        .unwrap()
    }

    fn setup() -> (SimulatedApp, RunBudget) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let app = SimulatedApp::new(
            Arc::new(graph()),
            None,
            Arc::clone(&clock),
            Duration::from_millis(100),
        );
        let budget = RunBudget::new(clock, Duration::from_secs(60), CancellationToken::new());
        (app, budget)
    }

    fn taken(tick: &ExplorerTick) -> Option<&ExplorerRecord> {
        match tick {
            ExplorerTick::ActionTaken(record) => Some(record),
            _ => None,
        }
    }

    /// Crashes on the first observation after a tap.
    struct CrashAfterTap {
        screen: &'static str,
        pending: Option<AppFault>,
        fault: AppFault,
    }

    impl AppUnderTest for CrashAfterTap {
        fn observe(&mut self) -> Result<ScreenState, AppFault> {
            if let Some(fault) = self.pending.take() {
                return Err(fault);
            }
            Ok(ScreenState {
                screen: self.screen.to_string(),
                elements: vec![UiElement {
                    id: Some("go".to_string()),
                    text: Some("Go".to_string()),
                    kind: crate::model::ElementKind::Button,
                    clickable: true,
                    editable: false,
                    enabled: true,
                }],
            })
        }

        fn perform(&mut self, _action: &UiAction) -> Result<(), AppFault> {
            self.screen = "next";
            self.pending = Some(self.fault.clone());
            Ok(())
        }

        fn recover(&mut self) -> Result<(), AppFault> {
            self.screen = "start";
            Ok(())
        }
    }

    fn crash_after_tap(fault: AppFault) -> CrashAfterTap {
        CrashAfterTap {
            screen: "start",
            pending: None,
            fault,
        }
    }

    #[test]
    fn crash_seen_right_after_an_action_is_attributed_to_it() {
        let (_, budget) = setup();
        let mut app = crash_after_tap(AppFault::Crashed("ANR".to_string()));
        let mut explorer = Explorer::new(ExplorerConfig::default());

        let tick = explorer.tick(&mut app, &budget);
        let record = taken(&tick).unwrap();
        assert!(record.crashed);
        assert_eq!(record.resulting_screen.as_deref(), Some("start"));

        let crash = &explorer.crashes()[0];
        assert_eq!(explorer.crashes().len(), 1);
        assert_eq!(crash.action.as_deref(), Some("tap"));
        assert_eq!(crash.screen.as_deref(), Some("start"));
        assert!(crash.recovered);
    }

    #[test]
    fn unrecoverable_fault_after_an_action_ends_exploration() {
        let (_, budget) = setup();
        let mut app = crash_after_tap(AppFault::Unrecoverable("process died".to_string()));
        let mut explorer = Explorer::new(ExplorerConfig::default());

        assert_eq!(
            explorer.tick(&mut app, &budget),
            ExplorerTick::Finished(ExplorationEnd::AppCrashed)
        );
        assert_eq!(explorer.actions_taken(), 1);
        let trace = explorer.into_trace();
        assert!(trace.actions[0].crashed);
        assert!(!trace.crashes[0].recovered);
    }

    #[test]
    fn seeded_screens_are_not_rediscovered() {
        let (mut app, budget) = setup();
        let home = app.observe().unwrap().fingerprint();
        let mut explorer =
            Explorer::with_visited(ExplorerConfig::default(), vec![home.clone(), home]);
        assert_eq!(explorer.visited_screens().len(), 1);
        explorer.tick(&mut app, &budget);
        // Only screen "a" is new; the seeded home screen is not captured again.
        assert_eq!(explorer.visited_screens().len(), 2);
        let trace = explorer.into_trace();
        assert_eq!(trace.screenshots.len(), 1);
        assert_eq!(trace.screenshots[0].screen, "a");
    }

    #[test]
    fn untried_elements_are_chosen_in_document_order() {
        let (mut app, budget) = setup();
        let mut explorer = Explorer::new(ExplorerConfig::default());
        let first = explorer.tick(&mut app, &budget);
        assert_eq!(taken(&first).and_then(|r| r.element_key.clone()), Some("id:a".to_string()));
        assert_eq!(taken(&first).map(|r| r.novelty), Some(2));
        // On screen "a": the only element leads home.
        let second = explorer.tick(&mut app, &budget);
        assert_eq!(taken(&second).and_then(|r| r.resulting_screen.clone()), Some("home".to_string()));
        // Back home, "b" is still untried and outranks "a".
        let third = explorer.tick(&mut app, &budget);
        assert_eq!(taken(&third).and_then(|r| r.element_key.clone()), Some("id:b".to_string()));
    }

    #[test]
    fn dead_end_screen_is_idle_and_eventually_stalls() {
        let (mut app, budget) = setup();
        let mut explorer = Explorer::new(ExplorerConfig {
            stall_threshold: 2,
            ..ExplorerConfig::default()
        });
        let mut ends = None;
        for _ in 0..50 {
            if let ExplorerTick::Finished(end) = explorer.tick(&mut app, &budget) {
                ends = Some(end);
                break;
            }
        }
        assert_eq!(ends, Some(ExplorationEnd::Stalled));
        assert_eq!(explorer.visited_screens().len(), 3);
    }

    #[test]
    fn max_actions_caps_exploration() {
        let (mut app, budget) = setup();
        let mut explorer = Explorer::new(ExplorerConfig {
            max_actions: Some(1),
            ..ExplorerConfig::default()
        });
        assert!(taken(&explorer.tick(&mut app, &budget)).is_some());
        assert_eq!(
            explorer.tick(&mut app, &budget),
            ExplorerTick::Finished(ExplorationEnd::Capped)
        );
        assert_eq!(explorer.actions_taken(), 1);
    }
}
