use crate::model::screen::{ElementKind, UiElement};
use serde::{Deserialize, Serialize};

/// Current script format version.
pub const SCRIPT_VERSION: u32 = 1;

/// Ordered list of UI actions executed before (or instead of) heuristic exploration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoboScript {
    pub script_version: u32,
    pub metadata: ScriptMetadata,
    pub steps: Vec<ActionStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScriptMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One scripted instruction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target: Option<Selector>,
    pub action: ActionKind,
    #[serde(default)]
    pub expect: Option<ExpectedOutcome>,
}

impl ActionStep {
    /// Display name, falling back to the action kind and position.
    #[must_use]
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", self.action.label(), index + 1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Tap,
    Input { text: String },
    Wait { ms: u64 },
    Assert,
    Back,
}

impl ActionKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tap => "tap",
            Self::Input { .. } => "input",
            Self::Wait { .. } => "wait",
            Self::Assert => "assert",
            Self::Back => "back",
        }
    }

    /// Whether the action operates on a resolved element.
    #[must_use]
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Tap | Self::Input { .. })
    }
}

/// Element selector. Every field that is set must match; `index` picks the n-th
/// match in document order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub text_contains: Option<String>,
    #[serde(default)]
    pub kind: Option<ElementKind>,
    #[serde(default)]
    pub index: Option<usize>,
}

impl Selector {
    #[must_use]
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.text.is_none() && self.text_contains.is_none() && self.kind.is_none()
    }

    #[must_use]
    pub fn matches(&self, element: &UiElement) -> bool {
        if let Some(id) = &self.id {
            if element.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            if element.text.as_deref() != Some(text.as_str()) {
                return false;
            }
        }
        if let Some(fragment) = &self.text_contains {
            if !element
                .text
                .as_deref()
                .is_some_and(|t| t.contains(fragment.as_str()))
            {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if element.kind != kind {
                return false;
            }
        }
        true
    }

    /// Resolve the selector against elements in document order.
    #[must_use]
    pub fn resolve<'a>(&self, elements: &'a [UiElement]) -> Option<&'a UiElement> {
        let index = self.index.unwrap_or(0);
        elements.iter().filter(|el| self.matches(el)).nth(index)
    }
}

/// Post-condition evaluated against the screen observed after a step's action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedOutcome {
    ScreenIs { screen: String },
    ElementVisible { selector: Selector },
    ElementAbsent { selector: Selector },
    TextVisible { text: String },
    TextMatches { pattern: String },
}

impl ExpectedOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScreenIs { .. } => "screen_is",
            Self::ElementVisible { .. } => "element_visible",
            Self::ElementAbsent { .. } => "element_absent",
            Self::TextVisible { .. } => "text_visible",
            Self::TextMatches { .. } => "text_matches",
        }
    }
}
