//! Simulated application described by a screen graph.
//!
//! Each screen lists its elements; tapping an element can navigate to another screen,
//! issue HTTP requests through the crawler's interceptor, or crash the app. The CLI uses
//! this to exercise the whole engine without a device, and the test suite uses it as a
//! deterministic app under test.

use crate::app::{AppFault, AppLauncher, AppUnderTest};
use crate::config::is_yaml;
use crate::interceptor::{HttpError, HttpRequest, HttpResponse, NetworkInterceptor};
use crate::model::{HttpMethod, RunId, ScreenState, Screenshot, UiAction, UiElement};
use crate::runner::clock::Clock;
use crate::runner::{CrawlerError, CrawlerResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScreenGraph {
    /// Screen shown at launch and after recovering from a crash.
    pub start: String,
    pub screens: Vec<SimScreen>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimScreen {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<SimElement>,
    /// Requests issued every time the screen is entered.
    #[serde(default)]
    pub on_enter: Vec<SimRequest>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimElement {
    #[serde(flatten)]
    pub element: UiElement,
    #[serde(default)]
    pub navigate_to: Option<String>,
    #[serde(default)]
    pub requests: Vec<SimRequest>,
    #[serde(default)]
    pub crash: Option<SimCrash>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub request_bytes: u64,
    #[serde(default)]
    pub response_bytes: u64,
    /// Simulate a transport failure with this message instead of a response.
    #[serde(default)]
    pub transport_error: Option<String>,
}

fn default_status() -> u16 {
    200
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimCrash {
    pub message: String,
    /// A fatal crash cannot be recovered from by relaunching.
    #[serde(default)]
    pub fatal: bool,
}

impl ScreenGraph {
    pub fn load(path: &Path) -> CrawlerResult<Self> {
        let data = fs::read_to_string(path)
            .map_err(|err| CrawlerError::io(ErrorCode::Io, "failed to read app model", err))?;
        let graph: Self = if is_yaml(path) {
            serde_yml::from_str(&data)
                .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse yaml", err))?
        } else {
            serde_json::from_str(&data)
                .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse json", err))?
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> CrawlerResult<()> {
        let mut names = HashSet::new();
        for screen in &self.screens {
            if !names.insert(screen.name.as_str()) {
                return Err(CrawlerError::protocol(format!(
                    "duplicate screen '{}' in app model",
                    screen.name
                )));
            }
        }
        if !names.contains(self.start.as_str()) {
            return Err(CrawlerError::protocol(format!(
                "start screen '{}' is not defined",
                self.start
            )));
        }
        for screen in &self.screens {
            for element in &screen.elements {
                if let Some(target) = &element.navigate_to {
                    if !names.contains(target.as_str()) {
                        return Err(CrawlerError::protocol(format!(
                            "screen '{}' navigates to unknown screen '{target}'",
                            screen.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn screen(&self, name: &str) -> Option<&SimScreen> {
        self.screens.iter().find(|screen| screen.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Running,
    Crashed,
    Dead,
}

pub struct SimulatedApp {
    graph: Arc<ScreenGraph>,
    current: String,
    back_stack: Vec<String>,
    inputs: BTreeMap<String, String>,
    liveness: Liveness,
    interceptor: Option<NetworkInterceptor>,
    clock: Arc<dyn Clock>,
    action_latency: Duration,
}

impl SimulatedApp {
    pub fn new(
        graph: Arc<ScreenGraph>,
        interceptor: Option<NetworkInterceptor>,
        clock: Arc<dyn Clock>,
        action_latency: Duration,
    ) -> Self {
        let mut app = Self {
            current: graph.start.clone(),
            graph,
            back_stack: Vec::new(),
            inputs: BTreeMap::new(),
            liveness: Liveness::Running,
            interceptor,
            clock,
            action_latency,
        };
        app.enter_current();
        app
    }

    #[must_use]
    pub fn current_screen(&self) -> &str {
        &self.current
    }

    fn enter_current(&mut self) {
        let requests = self
            .graph
            .screen(&self.current)
            .map(|screen| screen.on_enter.clone())
            .unwrap_or_default();
        self.issue(&requests);
    }

    fn issue(&self, requests: &[SimRequest]) {
        let Some(interceptor) = &self.interceptor else {
            return;
        };
        for sim in requests {
            let request = HttpRequest {
                method: sim.method,
                url: sim.url.clone(),
                body_bytes: sim.request_bytes,
            };
            let mut backend = |_req: &HttpRequest| -> Result<HttpResponse, HttpError> {
                match &sim.transport_error {
                    Some(message) => Err(HttpError(message.clone())),
                    None => Ok(HttpResponse {
                        status: sim.status,
                        body_bytes: sim.response_bytes,
                    }),
                }
            };
            let _ = interceptor.intercept(&request, &mut backend);
        }
    }

    fn find_element(&self, wanted: &UiElement) -> Option<SimElement> {
        let screen = self.graph.screen(&self.current)?;
        // Rows sharing an id are told apart by their text.
        let exact = screen.elements.iter().find(|el| {
            el.element.id == wanted.id
                && el.element.kind == wanted.kind
                && el.element.text == wanted.text
        });
        exact
            .or_else(|| {
                let key = key_in(screen, wanted);
                screen
                    .elements
                    .iter()
                    .enumerate()
                    .find(|(position, el)| el.element.key(*position) == key)
                    .map(|(_, el)| el)
            })
            .cloned()
    }

    fn navigate(&mut self, target: &str) {
        let previous = std::mem::replace(&mut self.current, target.to_string());
        self.back_stack.push(previous);
        self.enter_current();
    }

    fn crash(&mut self, crash: &SimCrash) -> AppFault {
        if crash.fatal {
            self.liveness = Liveness::Dead;
            AppFault::Unrecoverable(crash.message.clone())
        } else {
            self.liveness = Liveness::Crashed;
            AppFault::Crashed(crash.message.clone())
        }
    }

    fn render(&self, state: &ScreenState) -> String {
        let mut out = format!("[{}]\n", state.screen);
        for element in &state.elements {
            let _ = writeln!(
                out,
                "  <{}> {} {}",
                element.kind.as_str(),
                element.id.as_deref().unwrap_or("-"),
                element.text.as_deref().unwrap_or("")
            );
        }
        out
    }
}

/// Key of `wanted` as it would be computed on `screen`, falling back to a structural match
/// for elements without id or text.
fn key_in(screen: &SimScreen, wanted: &UiElement) -> String {
    let position = screen
        .elements
        .iter()
        .position(|el| {
            el.element.id == wanted.id && el.element.kind == wanted.kind && el.element.id.is_some()
        })
        .or_else(|| {
            screen
                .elements
                .iter()
                .position(|el| el.element.kind == wanted.kind && el.element.text == wanted.text)
        })
        .unwrap_or(usize::MAX);
    wanted.key(position)
}

impl AppUnderTest for SimulatedApp {
    fn observe(&mut self) -> Result<ScreenState, AppFault> {
        match self.liveness {
            Liveness::Running => {}
            Liveness::Crashed => return Err(AppFault::Crashed("app is not running".to_string())),
            Liveness::Dead => return Err(AppFault::Unrecoverable("app is gone".to_string())),
        }
        let screen = self.graph.screen(&self.current).ok_or_else(|| {
            AppFault::Unrecoverable(format!("unknown screen '{}'", self.current))
        })?;
        let elements = screen
            .elements
            .iter()
            .enumerate()
            .map(|(position, sim)| {
                let mut element = sim.element.clone();
                if let Some(value) = self.inputs.get(&element.key(position)) {
                    if element.editable {
                        element.text = Some(value.clone());
                    }
                }
                element
            })
            .collect();
        Ok(ScreenState {
            screen: screen.name.clone(),
            elements,
        })
    }

    fn perform(&mut self, action: &UiAction) -> Result<(), AppFault> {
        if self.liveness != Liveness::Running {
            return Err(AppFault::Crashed("app is not running".to_string()));
        }
        self.clock.sleep(self.action_latency);
        match action {
            UiAction::Back => {
                if let Some(previous) = self.back_stack.pop() {
                    self.current = previous;
                    self.enter_current();
                }
                Ok(())
            }
            UiAction::Tap { element } => {
                let Some(sim) = self.find_element(element) else {
                    return Ok(());
                };
                self.issue(&sim.requests);
                if let Some(crash) = &sim.crash {
                    return Err(self.crash(crash));
                }
                if let Some(target) = &sim.navigate_to {
                    self.navigate(target);
                }
                Ok(())
            }
            UiAction::Input { element, text } => {
                let Some(screen) = self.graph.screen(&self.current) else {
                    return Ok(());
                };
                let key = key_in(screen, element);
                let Some(sim) = self.find_element(element) else {
                    return Ok(());
                };
                self.inputs.insert(key, text.clone());
                self.issue(&sim.requests);
                if let Some(crash) = &sim.crash {
                    return Err(self.crash(crash));
                }
                Ok(())
            }
        }
    }

    fn recover(&mut self) -> Result<(), AppFault> {
        if self.liveness == Liveness::Dead {
            return Err(AppFault::Unrecoverable("app cannot be relaunched".to_string()));
        }
        self.liveness = Liveness::Running;
        self.current = self.graph.start.clone();
        self.back_stack.clear();
        self.enter_current();
        Ok(())
    }

    fn screenshot(&mut self) -> Option<Screenshot> {
        let state = self.observe().ok()?;
        Some(Screenshot {
            screen: state.screen.clone(),
            extension: "txt".to_string(),
            data: self.render(&state).into_bytes(),
            path: None,
        })
    }
}

/// Launches a fresh [`SimulatedApp`] per run.
pub struct SimulatedLauncher {
    graph: Arc<ScreenGraph>,
    interceptor: Option<NetworkInterceptor>,
    clock: Arc<dyn Clock>,
    action_latency: Duration,
}

impl SimulatedLauncher {
    pub fn new(graph: ScreenGraph, clock: Arc<dyn Clock>) -> Self {
        Self {
            graph: Arc::new(graph),
            interceptor: None,
            clock,
            action_latency: Duration::ZERO,
        }
    }

    /// Route the app's HTTP traffic through `interceptor`.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: NetworkInterceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Time each action takes on the launcher's clock.
    #[must_use]
    pub fn with_action_latency(mut self, latency: Duration) -> Self {
        self.action_latency = latency;
        self
    }
}

impl AppLauncher for SimulatedLauncher {
    fn launch(&self, run_id: RunId) -> Result<Box<dyn AppUnderTest>, AppFault> {
        tracing::debug!(%run_id, start = %self.graph.start, "launching simulated app");
        Ok(Box::new(SimulatedApp::new(
            Arc::clone(&self.graph),
            self.interceptor.clone(),
            Arc::clone(&self.clock),
            self.action_latency,
        )))
    }
}
