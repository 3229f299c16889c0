use crate::model::ErrorInfo;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type CrawlerResult<T> = Result<T, CrawlerError>;

/// Stable error codes surfaced in results, logs and CLI exit statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_ALREADY_RUNNING")]
    AlreadyRunning,
    #[serde(rename = "E_INVALID_SETTINGS")]
    InvalidSettings,
    #[serde(rename = "E_SCRIPT_LOAD")]
    ScriptLoad,
    #[serde(rename = "E_PROTOCOL")]
    Protocol,
    #[serde(rename = "E_TARGET_NOT_FOUND")]
    TargetNotFound,
    #[serde(rename = "E_ASSERTION_FAILED")]
    AssertionFailed,
    #[serde(rename = "E_APP_CRASH")]
    AppCrash,
    #[serde(rename = "E_APP_LAUNCH")]
    AppLaunch,
    #[serde(rename = "E_REPORT_PERSIST")]
    ReportPersist,
    #[serde(rename = "E_IO")]
    Io,
    #[serde(rename = "E_INTERNAL")]
    Internal,
    #[serde(rename = "E_CANCELLED")]
    Cancelled,
}

impl ErrorCode {
    pub const ALL: [Self; 12] = [
        Self::AlreadyRunning,
        Self::InvalidSettings,
        Self::ScriptLoad,
        Self::Protocol,
        Self::TargetNotFound,
        Self::AssertionFailed,
        Self::AppCrash,
        Self::AppLaunch,
        Self::ReportPersist,
        Self::Io,
        Self::Internal,
        Self::Cancelled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyRunning => "E_ALREADY_RUNNING",
            Self::InvalidSettings => "E_INVALID_SETTINGS",
            Self::ScriptLoad => "E_SCRIPT_LOAD",
            Self::Protocol => "E_PROTOCOL",
            Self::TargetNotFound => "E_TARGET_NOT_FOUND",
            Self::AssertionFailed => "E_ASSERTION_FAILED",
            Self::AppCrash => "E_APP_CRASH",
            Self::AppLaunch => "E_APP_LAUNCH",
            Self::ReportPersist => "E_REPORT_PERSIST",
            Self::Io => "E_IO",
            Self::Internal => "E_INTERNAL",
            Self::Cancelled => "E_CANCELLED",
        }
    }

    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Process exit code used by the CLI.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::AlreadyRunning => 2,
            Self::InvalidSettings => 3,
            Self::ScriptLoad => 4,
            Self::Protocol => 5,
            Self::TargetNotFound => 6,
            Self::AssertionFailed => 7,
            Self::AppCrash => 8,
            Self::AppLaunch => 9,
            Self::ReportPersist => 10,
            Self::Io => 11,
            Self::Internal => 12,
            Self::Cancelled => 13,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CrawlerError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<Value>,
}

impl CrawlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn already_running(context: impl Into<Option<Value>>) -> Self {
        Self {
            code: ErrorCode::AlreadyRunning,
            message: "a robo test is already running".to_string(),
            context: context.into(),
        }
    }

    pub fn invalid_settings(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSettings, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message)
    }

    pub fn script_load(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ScriptLoad, message)
            .with_context(serde_json::json!({ "source": err.to_string() }))
    }

    pub fn io(code: ErrorCode, message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(code, message).with_context(serde_json::json!({ "source": err.to_string() }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }

    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code.as_str().to_string(),
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl Diagnostic for CrawlerError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }
}
