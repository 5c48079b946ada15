//! Fetch contract shared by all fetcher layers
//!
//! A fetch drives exactly one [`FetchHandler`] through an ordered
//! sequence: `headers_complete`, zero or more `write` calls, then
//! `done` exactly once. Partial writes before a failed `done` are
//! discardable. Layers compose by wrapping [`UrlFetcher`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use pagecore_cache::ResponseHeaders;

/// Terminal result of one fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Headers and full decoded body were delivered.
    Success,
    /// The fetch did not finish before its deadline.
    TimedOut,
    /// The caller requested cancellation.
    Canceled,
    /// TCP connect or DNS resolution failed.
    ConnectError,
    /// TLS negotiation or certificate validation failed.
    SslError,
    /// The origin answered with a non-success status.
    HttpError(u16),
    /// A rate-control queue was full; the fetch never started.
    ResourceExhausted,
}

impl FetchOutcome {
    pub fn is_success(self) -> bool {
        self == FetchOutcome::Success
    }
}

/// Cross-thread cancellation request, observed by the fetcher at chunk
/// boundaries. Best-effort: a fetch may still complete after the flag
/// is raised.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One outbound request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    /// Absolute wall-clock deadline in microseconds; `None` defers to
    /// the fetcher's own timeout.
    pub deadline_us: Option<i64>,
    pub cancel: CancelFlag,
}

impl RequestContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_headers: Vec::new(),
            deadline_us: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_deadline_us(mut self, deadline_us: i64) -> Self {
        self.deadline_us = Some(deadline_us);
        self
    }
}

/// Receiver of one fetch's event stream.
///
/// Per fetch, calls are serialized and ordered: `headers_complete`
/// before any `write`, and `done` last, exactly once. Across fetches
/// events interleave freely.
#[async_trait]
pub trait FetchHandler: Send {
    async fn headers_complete(&mut self, headers: &ResponseHeaders);
    async fn write(&mut self, bytes: Bytes);
    async fn done(&mut self, outcome: FetchOutcome);
}

/// Asynchronous URL fetcher. `fetch` resolves once the terminal `done`
/// callback has been delivered, and returns the same outcome.
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, request: RequestContext, handler: &mut dyn FetchHandler)
        -> FetchOutcome;
}

/// Handler collecting headers and body into memory.
///
/// The standard terminal handler for fetches whose consumer wants the
/// whole response at once; also the workhorse of fetcher tests.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub headers: Option<ResponseHeaders>,
    pub body: Vec<u8>,
    pub outcome: Option<FetchOutcome>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FetchHandler for CollectingHandler {
    async fn headers_complete(&mut self, headers: &ResponseHeaders) {
        self.headers = Some(headers.clone());
    }

    async fn write(&mut self, bytes: Bytes) {
        self.body.extend_from_slice(&bytes);
    }

    async fn done(&mut self, outcome: FetchOutcome) {
        assert!(self.outcome.is_none(), "done delivered twice");
        self.outcome = Some(outcome);
    }
}
