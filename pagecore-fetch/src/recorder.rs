//! In-place response recording
//!
//! Captures origin responses into the HTTP cache while they stream to
//! the client. Recording is opportunistic: a response over the byte
//! cap, or arriving while too many recordings are active, simply passes
//! through uncaptured. The client-facing stream is never delayed or
//! altered.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use pagecore_cache::{HttpCache, ResponseHeaders};

use crate::fetch::{FetchHandler, FetchOutcome};

/// Default cap on recorded body size.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1 << 20;
/// Default cap on concurrent recordings.
pub const DEFAULT_MAX_CONCURRENT_RECORDINGS: usize = 10;

/// Shared recording policy and budget.
pub struct InPlaceRecorder {
    cache: Arc<HttpCache>,
    max_response_bytes: usize,
    max_concurrent_recordings: usize,
    active: AtomicUsize,
}

impl InPlaceRecorder {
    pub fn new(
        cache: Arc<HttpCache>,
        max_response_bytes: usize,
        max_concurrent_recordings: usize,
    ) -> Self {
        Self {
            cache,
            max_response_bytes,
            max_concurrent_recordings,
            active: AtomicUsize::new(0),
        }
    }

    /// Wrap `inner` so the response for `key` is recorded as it streams
    /// through. When the concurrency budget is spent the handler still
    /// forwards everything but records nothing.
    pub fn wrap(
        self: &Arc<Self>,
        key: impl Into<String>,
        inner: Box<dyn FetchHandler>,
    ) -> RecordingHandler {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_concurrent_recordings).then_some(n + 1)
            })
            .is_ok();
        let key = key.into();
        if !admitted {
            trace!("Recording budget spent, passing through {key}");
        }
        RecordingHandler {
            recorder: self.clone(),
            key,
            inner,
            recording: admitted,
            counted: admitted,
            headers: None,
            body: Vec::new(),
        }
    }

    pub fn active_recordings(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Pass-through handler accumulating a copy of the response.
pub struct RecordingHandler {
    recorder: Arc<InPlaceRecorder>,
    key: String,
    inner: Box<dyn FetchHandler>,
    recording: bool,
    counted: bool,
    headers: Option<ResponseHeaders>,
    body: Vec<u8>,
}

impl RecordingHandler {
    fn abandon(&mut self) {
        self.recording = false;
        self.headers = None;
        self.body = Vec::new();
        self.release();
    }

    fn release(&mut self) {
        if self.counted {
            self.counted = false;
            self.recorder.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[async_trait]
impl FetchHandler for RecordingHandler {
    async fn headers_complete(&mut self, headers: &ResponseHeaders) {
        if self.recording {
            self.headers = Some(headers.clone());
        }
        self.inner.headers_complete(headers).await;
    }

    async fn write(&mut self, bytes: Bytes) {
        if self.recording {
            if self.body.len() + bytes.len() > self.recorder.max_response_bytes {
                debug!("Response for {} exceeds recording cap, dropping copy", self.key);
                self.abandon();
            } else {
                self.body.extend_from_slice(&bytes);
            }
        }
        self.inner.write(bytes).await;
    }

    async fn done(&mut self, outcome: FetchOutcome) {
        if self.recording && outcome.is_success() {
            if let Some(headers) = self.headers.take() {
                // The cache applies its own cacheability policy; an
                // uncacheable response is dropped there.
                self.recorder.cache.put(&self.key, &headers, &self.body).await;
            }
        }
        self.release();
        self.recording = false;
        self.inner.done(outcome).await;
    }
}

impl Drop for RecordingHandler {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::CollectingHandler;
    use pagecore_base::stats::Statistics;
    use pagecore_base::timer::MockTimer;
    use pagecore_cache::{HttpCacheResult, InMemoryCache};

    fn recorder(max_bytes: usize, max_concurrent: usize) -> (Arc<HttpCache>, Arc<InPlaceRecorder>) {
        let stats = HttpCache::register_stats(Statistics::builder()).local();
        let timer = Arc::new(MockTimer::new(1_700_000_000_000_000));
        let backend = Arc::new(InMemoryCache::new("mem"));
        let cache = Arc::new(HttpCache::new(backend, timer, &stats));
        let pool = Arc::new(InPlaceRecorder::new(cache.clone(), max_bytes, max_concurrent));
        (cache, pool)
    }

    fn cacheable_headers() -> ResponseHeaders {
        let mut h = ResponseHeaders::new(200, "OK");
        h.add("Cache-Control", "max-age=600");
        h
    }

    #[tokio::test]
    async fn test_successful_response_is_recorded() {
        let (cache, pool) = recorder(1024, 4);
        let mut handler = pool.wrap("k", Box::new(CollectingHandler::new()));
        handler.headers_complete(&cacheable_headers()).await;
        handler.write(Bytes::from_static(b"hello ")).await;
        handler.write(Bytes::from_static(b"world")).await;
        handler.done(FetchOutcome::Success).await;

        match cache.get("k").await {
            HttpCacheResult::Found { body, .. } => assert_eq!(body.as_slice(), b"hello world"),
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(pool.active_recordings(), 0);
    }

    #[tokio::test]
    async fn test_oversized_response_passes_through_unrecorded() {
        let (cache, pool) = recorder(8, 4);
        let mut handler = pool.wrap("k", Box::new(CollectingHandler::new()));
        handler.headers_complete(&cacheable_headers()).await;
        handler.write(Bytes::from_static(b"0123456789")).await;
        handler.done(FetchOutcome::Success).await;

        assert!(!cache.get("k").await.is_found());
        // The budget slot was returned at the moment the cap tripped.
        assert_eq!(pool.active_recordings(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_discards_partial_recording() {
        let (cache, pool) = recorder(1024, 4);
        let mut handler = pool.wrap("k", Box::new(CollectingHandler::new()));
        handler.headers_complete(&cacheable_headers()).await;
        handler.write(Bytes::from_static(b"partial")).await;
        handler.done(FetchOutcome::ConnectError).await;

        assert!(!cache.get("k").await.is_found());
    }

    #[tokio::test]
    async fn test_concurrency_cap_disables_excess_recordings() {
        let (cache, pool) = recorder(1024, 1);
        let first = pool.wrap("a", Box::new(CollectingHandler::new()));
        let mut second = pool.wrap("b", Box::new(CollectingHandler::new()));

        second.headers_complete(&cacheable_headers()).await;
        second.write(Bytes::from_static(b"x")).await;
        second.done(FetchOutcome::Success).await;
        assert!(!cache.get("b").await.is_found());

        drop(first);
        assert_eq!(pool.active_recordings(), 0);
    }

    #[tokio::test]
    async fn test_uncacheable_response_is_not_stored() {
        let (cache, pool) = recorder(1024, 4);
        let mut headers = ResponseHeaders::new(200, "OK");
        headers.add("Cache-Control", "no-store");
        let mut handler = pool.wrap("k", Box::new(CollectingHandler::new()));
        handler.headers_complete(&headers).await;
        handler.write(Bytes::from_static(b"private")).await;
        handler.done(FetchOutcome::Success).await;

        assert!(!cache.get("k").await.is_found());
    }
}
