//! Network traffic interceptor.
//!
//! The host installs a [`NetworkInterceptor`] in its HTTP stack. Every exchange passes
//! through [`NetworkInterceptor::intercept`] untouched; while a run's capture window is
//! open the exchange is also checked against the run's [`RequestMethodFilter`] and, if
//! kept, pushed onto a channel that the coordinator drains once the run ends.
//!
//! Capture calls may come from any thread. The hot path only takes a shared read lock
//! and sends on an unbounded channel. Closing the window takes the write lock, which
//! waits for in-flight sends and guarantees nothing is captured after the window closes.

use crate::model::{HttpMethod, RequestMethodFilter, TrafficCapture, TrafficRecord};
use crate::runner::clock::{duration_ms, Clock};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body_bytes: u64,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body_bytes: 0,
        }
    }

    /// Path component of the URL, without query or fragment.
    #[must_use]
    pub fn path(&self) -> String {
        path_of(&self.url)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("http transport error: {0}")]
pub struct HttpError(pub String);

/// The rest of the host's HTTP pipeline, as seen from the interceptor.
pub trait Chain {
    fn proceed(&mut self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

impl<F> Chain for F
where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, HttpError>,
{
    fn proceed(&mut self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self(request)
    }
}

struct CaptureWindow {
    tx: Sender<TrafficRecord>,
    rx: Receiver<TrafficRecord>,
    filter: Option<Arc<RequestMethodFilter>>,
    clock: Arc<dyn Clock>,
    opened_at: Duration,
    sequence: AtomicU64,
    observed: AtomicU64,
    filtered_out: AtomicU64,
}

impl CaptureWindow {
    fn keeps(&self, method: HttpMethod, path: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.matches(method, path))
    }

    fn since_open(&self, at: Duration) -> u64 {
        duration_ms(at.saturating_sub(self.opened_at))
    }
}

#[derive(Default)]
struct Inner {
    window: RwLock<Option<CaptureWindow>>,
}

/// Cloneable handle; all clones share the same capture window.
#[derive(Clone, Default)]
pub struct NetworkInterceptor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NetworkInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInterceptor")
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

impl NetworkInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.inner.window.read().is_some()
    }

    /// Start a capture window. Any records left from a previous window are discarded.
    pub fn open_window(&self, filter: Option<RequestMethodFilter>, clock: Arc<dyn Clock>) {
        let (tx, rx) = unbounded();
        let opened_at = clock.elapsed();
        let window = CaptureWindow {
            tx,
            rx,
            filter: filter.map(Arc::new),
            clock,
            opened_at,
            sequence: AtomicU64::new(0),
            observed: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
        };
        let previous = self.inner.window.write().replace(window);
        if previous.is_some() {
            tracing::warn!("capture window reopened before previous window was drained");
        }
    }

    /// Close the window and hand over everything captured in it, in capture order.
    /// Returns an empty capture when no window is open.
    pub fn drain_records(&self) -> TrafficCapture {
        let Some(window) = self.inner.window.write().take() else {
            return TrafficCapture::default();
        };
        let CaptureWindow {
            tx,
            rx,
            observed,
            filtered_out,
            ..
        } = window;
        drop(tx);
        let mut records: Vec<TrafficRecord> = rx.try_iter().collect();
        records.sort_by_key(|record| record.sequence);
        TrafficCapture {
            records,
            observed: observed.into_inner(),
            filtered_out: filtered_out.into_inner(),
        }
    }

    /// Whether the exchange would be kept by the open window. `false` when no run is active.
    #[must_use]
    pub fn should_capture(&self, request: &HttpRequest) -> bool {
        self.inner
            .window
            .read()
            .as_ref()
            .is_some_and(|window| window.keeps(request.method, &request.path()))
    }

    /// Record a finished exchange. No-op when no window is open.
    pub fn record(
        &self,
        request: &HttpRequest,
        outcome: Result<&HttpResponse, &HttpError>,
        started_at: Duration,
    ) {
        let guard = self.inner.window.read();
        let Some(window) = guard.as_ref() else {
            return;
        };
        // Requests issued before the window opened belong to no run.
        if started_at < window.opened_at {
            return;
        }
        window.observed.fetch_add(1, Ordering::Relaxed);
        let path = request.path();
        if !window.keeps(request.method, &path) {
            window.filtered_out.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let ended_at = window.clock.elapsed();
        let (status, error, response_bytes) = match outcome {
            Ok(response) => (Some(response.status), None, response.body_bytes),
            Err(err) => (None, Some(err.0.clone()), 0),
        };
        let record = TrafficRecord {
            sequence: window.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            method: request.method,
            url: request.url.clone(),
            path,
            status,
            error,
            timestamp_ms: window.since_open(started_at),
            duration_ms: duration_ms(ended_at.saturating_sub(started_at)),
            request_bytes: request.body_bytes,
            response_bytes,
        };
        tracing::trace!(method = %record.method, path = %record.path, status = ?record.status, "captured request");
        // The receiver lives in the same window, so the send cannot fail while we hold the guard.
        let _ = window.tx.send(record);
    }

    /// Pass the request down the chain unchanged, recording the exchange on the way back.
    pub fn intercept<C>(&self, request: &HttpRequest, chain: &mut C) -> Result<HttpResponse, HttpError>
    where
        C: Chain + ?Sized,
    {
        let clock = self
            .inner
            .window
            .read()
            .as_ref()
            .map(|window| Arc::clone(&window.clock));
        let Some(clock) = clock else {
            return chain.proceed(request);
        };
        let started_at = clock.elapsed();
        let outcome = chain.proceed(request);
        self.record(request, outcome.as_ref(), started_at);
        outcome
    }
}

/// Path component of a URL. Relative references are accepted as-is.
#[must_use]
pub fn path_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => {
            let end = url.find(['?', '#']).unwrap_or(url.len());
            url.get(..end).unwrap_or(url).to_string()
        }
    }
}
