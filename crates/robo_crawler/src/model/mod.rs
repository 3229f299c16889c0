pub mod ids;
pub mod run;
pub mod screen;
pub mod script;
pub mod settings;
pub mod traffic;

pub use ids::{ListenerId, RunId};
pub use run::*;
pub use screen::*;
pub use script::*;
pub use settings::*;
pub use traffic::*;

/// Maximum length for user-supplied regex patterns to prevent `ReDoS` attacks.
pub const MAX_REGEX_PATTERN_LEN: usize = 1000;
