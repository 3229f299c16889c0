use crate::model::settings::HttpMethod;
use serde::{Deserialize, Serialize};

/// HTTP exchange captured by the interceptor during a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRecord {
    /// Capture order within the run (1-based).
    pub sequence: u64,
    pub method: HttpMethod,
    pub url: String,
    pub path: String,
    /// Response status, `None` when the transport failed.
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    /// Milliseconds since run start when the request was issued.
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

/// Everything the interceptor collected during one capture window.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficCapture {
    pub records: Vec<TrafficRecord>,
    /// Exchanges seen while the window was open, captured or not.
    pub observed: u64,
    /// Exchanges rejected by the request filter.
    pub filtered_out: u64,
}
