//! Robo Crawler: an automated UI exploration engine.
//!
//! A robo test drives an application through an optional action script and then through
//! heuristic exploration, captures the app's HTTP traffic through an interceptor, and
//! persists a report per run. [`RoboCrawler`] is the entry point; it enforces that at most
//! one run is in flight and notifies registered listeners when a run finishes.

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]

pub mod app;
pub mod assertions;
pub mod config;
pub mod explorer;
pub mod interceptor;
pub mod model;
pub mod report;
pub mod runner;
pub mod script;

pub use crate::config::CrawlerConfig;
pub use crate::interceptor::{Chain, HttpError, HttpRequest, HttpResponse, NetworkInterceptor};
pub use crate::model::*;
pub use crate::runner::{
    CrawlerError, CrawlerResult, ErrorCode, ListenerScope, RoboCrawler, RunHandle, ScopeHandle,
};
