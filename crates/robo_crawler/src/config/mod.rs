//! Crawler configuration shared by every run of a [`RoboCrawler`](crate::runner::RoboCrawler).
//!
//! Configuration is read once, from JSON or YAML, and covers the knobs that are not part
//! of per-run [`TestSettings`](crate::model::TestSettings): where reports go, the hard
//! run-length ceiling, script retry behavior and explorer heuristics.

use crate::model::MAX_RUN_MINUTES_CEILING;
use crate::runner::{CrawlerError, CrawlerResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Directory under which one `run-<id>` directory is written per run.
    pub report_root: PathBuf,
    pub max_run_minutes_ceiling: u32,
    pub script: ScriptEngineConfig,
    pub explorer: ExplorerConfig,
    /// Directory holding scripts referenced as bundled assets.
    pub bundled_script_dir: Option<PathBuf>,
    pub remote_timeout_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            report_root: PathBuf::from("robo-reports"),
            max_run_minutes_ceiling: MAX_RUN_MINUTES_CEILING,
            script: ScriptEngineConfig::default(),
            explorer: ExplorerConfig::default(),
            bundled_script_dir: None,
            remote_timeout_ms: 10_000,
        }
    }
}

impl CrawlerConfig {
    #[must_use]
    pub fn with_report_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.report_root = root.into();
        self
    }

    pub fn validate(&self) -> CrawlerResult<()> {
        if self.max_run_minutes_ceiling == 0 {
            return Err(CrawlerError::invalid_settings(
                "max_run_minutes_ceiling must be at least 1",
            ));
        }
        if self.script.backoff_multiplier == 0 {
            return Err(CrawlerError::invalid_settings(
                "script.backoff_multiplier must be at least 1",
            ));
        }
        if self.explorer.stall_threshold == 0 {
            return Err(CrawlerError::invalid_settings(
                "explorer.stall_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retry policy for resolving a step's target selector.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptEngineConfig {
    /// Extra observations after the first before giving up with `E_TARGET_NOT_FOUND`.
    pub target_retries: u32,
    pub retry_backoff_ms: u64,
    pub backoff_multiplier: u32,
}

impl Default for ScriptEngineConfig {
    fn default() -> Self {
        Self {
            target_retries: 3,
            retry_backoff_ms: 200,
            backoff_multiplier: 2,
        }
    }
}

impl ScriptEngineConfig {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.backoff_multiplier).saturating_pow(attempt);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Consecutive ticks without an actionable element before exploration ends.
    pub stall_threshold: u32,
    /// Text typed into editable elements.
    pub input_text: String,
    pub max_actions: Option<u64>,
    pub screenshot_new_screens: bool,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            input_text: "robo".to_string(),
            max_actions: None,
            screenshot_new_screens: true,
        }
    }
}

/// Load a config file; `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
pub fn load_config_file(path: &Path) -> CrawlerResult<CrawlerConfig> {
    let data = fs::read_to_string(path)
        .map_err(|err| CrawlerError::io(ErrorCode::Io, "failed to read config file", err))?;
    let config: CrawlerConfig = if is_yaml(path) {
        serde_yml::from_str(&data)
            .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse yaml", err))?
    } else {
        serde_json::from_str(&data)
            .map_err(|err| CrawlerError::io(ErrorCode::Protocol, "failed to parse json", err))?
    };
    config.validate()?;
    Ok(config)
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}
