use crate::model::script::RoboScript;
use crate::runner::{CrawlerError, CrawlerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Run length used when the caller does not pick one.
pub const DEFAULT_MAX_RUN_MINUTES: u32 = 5;

/// Hard ceiling applied to every run unless the crawler config lowers it.
pub const MAX_RUN_MINUTES_CEILING: u32 = 30;

/// Settings for a single robo test run.
///
/// Settings are cloned into the run when it starts and never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestSettings {
    /// Where to load the action script from. `None` runs an unscripted crawl.
    #[serde(default)]
    pub script: Option<ScriptSource>,
    /// Requested run length in minutes; clamped to `[1, ceiling]` at start.
    #[serde(default = "default_max_run_minutes")]
    pub max_run_minutes: u32,
    /// Stop after the script phase instead of continuing with heuristic exploration.
    #[serde(default)]
    pub run_only_script: bool,
    /// Which HTTP exchanges the interceptor keeps. `None` keeps everything.
    #[serde(default)]
    pub request_filter: Option<RequestMethodFilter>,
}

fn default_max_run_minutes() -> u32 {
    DEFAULT_MAX_RUN_MINUTES
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            script: None,
            max_run_minutes: DEFAULT_MAX_RUN_MINUTES,
            run_only_script: false,
            request_filter: None,
        }
    }
}

impl TestSettings {
    /// Unscripted crawl bounded by `max_run_minutes`.
    #[must_use]
    pub fn auto(max_run_minutes: u32) -> Self {
        Self {
            max_run_minutes,
            ..Self::default()
        }
    }

    /// Scripted run, optionally followed by heuristic exploration.
    #[must_use]
    pub fn with_script(source: ScriptSource, max_run_minutes: u32, run_only_script: bool) -> Self {
        Self {
            script: Some(source),
            max_run_minutes,
            run_only_script,
            request_filter: None,
        }
    }

    #[must_use]
    pub fn request_filter(mut self, filter: RequestMethodFilter) -> Self {
        self.request_filter = Some(filter);
        self
    }

    /// Run length after clamping to `[1, ceiling]`.
    #[must_use]
    pub fn effective_run_minutes(&self, ceiling: u32) -> u32 {
        self.max_run_minutes.clamp(1, ceiling.max(1))
    }

    /// Reject combinations that cannot describe a run.
    pub fn validate(&self) -> CrawlerResult<()> {
        if self.run_only_script && self.script.is_none() {
            return Err(CrawlerError::invalid_settings(
                "run_only_script requires a script source",
            ));
        }
        Ok(())
    }
}

/// Origin of an action script.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptSource {
    /// File on the local filesystem (`.json`, `.yaml` or `.yml`).
    Path { path: PathBuf },
    /// Script shipped with the host, resolved under the configured bundle directory.
    Bundled { name: String },
    /// Script fetched over HTTP(S) before the run.
    Remote { url: String },
    /// Script supplied directly by the caller.
    Inline { script: RoboScript },
}

impl ScriptSource {
    /// Short human readable description used in logs and reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Path { path } => format!("path:{}", path.display()),
            Self::Bundled { name } => format!("bundled:{name}"),
            Self::Remote { url } => format!("remote:{url}"),
            Self::Inline { script } => format!("inline:{}", script.metadata.name),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown http method '{0}'")]
pub struct UnknownMethod(pub String);

impl FromStr for HttpMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// Predicate deciding which HTTP exchanges are kept for the report.
///
/// A request is captured when its method is allowed (an empty set allows any method)
/// and its path contains one of `paths` (an empty list allows any path). Requests whose
/// path contains one of `always_paths` are captured regardless of method.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMethodFilter {
    #[serde(default)]
    pub methods: BTreeSet<HttpMethod>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub always_paths: Vec<String>,
}

impl RequestMethodFilter {
    #[must_use]
    pub fn methods(methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Only `GET` calls, plus any call whose path contains one of `always_paths`.
    #[must_use]
    pub fn method_get_filter(always_paths: Vec<String>) -> Self {
        Self {
            always_paths,
            ..Self::methods([HttpMethod::Get])
        }
    }

    /// `GET` and `POST` calls, plus any call whose path contains one of `always_paths`.
    #[must_use]
    pub fn method_get_post_filter(always_paths: Vec<String>) -> Self {
        Self {
            always_paths,
            ..Self::methods([HttpMethod::Get, HttpMethod::Post])
        }
    }

    /// `GET`, `POST` and `DELETE` calls, plus any call whose path contains one of `always_paths`.
    #[must_use]
    pub fn method_get_post_delete_filter(always_paths: Vec<String>) -> Self {
        Self {
            always_paths,
            ..Self::methods([HttpMethod::Get, HttpMethod::Post, HttpMethod::Delete])
        }
    }

    #[must_use]
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    #[must_use]
    pub fn matches(&self, method: HttpMethod, path: &str) -> bool {
        if self.always_paths.iter().any(|p| path.contains(p.as_str())) {
            return true;
        }
        let method_ok = self.methods.is_empty() || self.methods.contains(&method);
        let path_ok = self.paths.is_empty() || self.paths.iter().any(|p| path.contains(p.as_str()));
        method_ok && path_ok
    }
}
