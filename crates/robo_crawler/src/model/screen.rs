use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Button,
    Input,
    Label,
    Image,
    Toggle,
    List,
}

impl ElementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Input => "input",
            Self::Label => "label",
            Self::Image => "image",
            Self::Toggle => "toggle",
            Self::List => "list",
        }
    }
}

/// Element visible on the current screen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiElement {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub kind: ElementKind,
    #[serde(default)]
    pub clickable: bool,
    #[serde(default)]
    pub editable: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl UiElement {
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.enabled && (self.clickable || self.editable)
    }

    /// Stable key used to track an element across observations of the same screen.
    #[must_use]
    pub fn key(&self, position: usize) -> String {
        match (&self.id, &self.text) {
            (Some(id), _) => format!("id:{id}"),
            (None, Some(text)) => format!("{}:{text}", self.kind.as_str()),
            (None, None) => format!("{}@{position}", self.kind.as_str()),
        }
    }
}

/// Observed state of the application's current screen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenState {
    /// Host-assigned screen name (an activity or route name).
    pub screen: String,
    /// Elements in document order.
    pub elements: Vec<UiElement>,
}

impl ScreenState {
    /// Fingerprint identifying the screen and its element structure, ignoring text
    /// that is not part of an element key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut data = self.screen.clone();
        for (position, element) in self.elements.iter().enumerate() {
            data.push('|');
            data.push_str(&element.key(position));
            if element.is_actionable() {
                data.push('*');
            }
        }
        format!("{:016x}", crate::report::fnv1a_hash(data.as_bytes()))
    }

    #[must_use]
    pub fn text_content(&self) -> String {
        self.elements
            .iter()
            .filter_map(|el| el.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Actionable elements with a key that is unique on this screen.
    ///
    /// Siblings sharing a key (list rows with one resource id) keep it for the first
    /// occurrence; later ones get `#2`, `#3`, ... in document order.
    #[must_use]
    pub fn keyed_actionable(&self) -> Vec<(usize, String, &UiElement)> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut keyed = Vec::new();
        for (position, element) in self.elements.iter().enumerate() {
            let base = element.key(position);
            let occurrence = seen.entry(base.clone()).or_insert(0);
            *occurrence += 1;
            if !element.is_actionable() {
                continue;
            }
            let key = if *occurrence == 1 {
                base
            } else {
                format!("{base}#{occurrence}")
            };
            keyed.push((position, key, element));
        }
        keyed
    }
}

/// Action issued to the application under test.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiAction {
    Tap { element: UiElement },
    Input { element: UiElement, text: String },
    Back,
}

impl UiAction {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tap { .. } => "tap",
            Self::Input { .. } => "input",
            Self::Back => "back",
        }
    }
}

/// Captured image or rendering of a screen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Screenshot {
    pub screen: String,
    /// File extension for the persisted artifact (`png`, `txt`, ...).
    pub extension: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Set by the report builder once the artifact is on disk.
    #[serde(default)]
    pub path: Option<String>,
}
