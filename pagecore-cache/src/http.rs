//! HTTP caching semantics over the abstract backend
//!
//! Adds freshness evaluation, negative caching, and optional body
//! compression on top of any [`CacheBackend`]. Internal bookkeeping
//! travels in `X-Pagecore-*` headers on the stored copy and is stripped
//! before a hit is returned, so callers see the origin headers
//! unchanged.

use std::sync::Arc;

use tracing::{debug, trace};

use pagecore_base::stats::{Statistics, StatisticsBuilder, Variable};
use pagecore_base::timer::SharedTimer;

use crate::compress;
use crate::headers::{CachePolicy, DEFAULT_IMPLICIT_CACHE_TTL_MS, ResponseHeaders};
use crate::interface::CacheBackend;
use crate::value::HttpValue;

/// Internal header carrying the absolute expiration in microseconds.
const EXPIRES_US_HEADER: &str = "X-Pagecore-Expires-Us";
/// Internal header marking a gzip-compressed body.
const GZIP_HEADER: &str = "X-Pagecore-Gzip";
/// Internal header marking a negative-cache sentinel.
const SENTINEL_HEADER: &str = "X-Pagecore-Sentinel";

const SENTINEL_NOT_CACHEABLE: &str = "not-cacheable";
const SENTINEL_FETCH_FAILED: &str = "fetch-failed";

/// Default TTL for "remember not cacheable" sentinels.
pub const DEFAULT_REMEMBER_NOT_CACHEABLE_TTL_MS: i64 = 5 * 60 * 1000;
/// Default TTL for "remember fetch failed" sentinels.
pub const DEFAULT_REMEMBER_FETCH_FAILED_TTL_MS: i64 = 5 * 60 * 1000;

/// Outcome of an HTTP cache lookup.
#[derive(Debug)]
pub enum HttpCacheResult {
    /// Fresh hit; headers are the origin headers, body is decompressed.
    Found {
        headers: ResponseHeaders,
        body: pagecore_base::SharedBuffer,
    },
    /// Absent, expired, or undecodable.
    NotFound,
    /// A recent origin fetch failed; do not re-fetch until the sentinel
    /// expires.
    RecentFetchFailed,
    /// The resource was recently found uncacheable.
    RecentNotCacheable,
}

impl HttpCacheResult {
    pub fn is_found(&self) -> bool {
        matches!(self, HttpCacheResult::Found { .. })
    }
}

struct HttpCacheStats {
    hits: Variable,
    misses: Variable,
    inserts: Variable,
    expirations: Variable,
    not_cacheable: Variable,
    recent_fetch_failures: Variable,
}

/// HTTP-aware cache over an abstract backend.
pub struct HttpCache {
    backend: Arc<dyn CacheBackend>,
    timer: SharedTimer,
    stats: HttpCacheStats,
    implicit_ttl_ms: i64,
    remember_not_cacheable_ttl_ms: i64,
    remember_fetch_failed_ttl_ms: i64,
    /// Compress bodies at least this large; `None` disables.
    min_compress_bytes: Option<usize>,
}

impl HttpCache {
    /// Register this component's counters; root and children must call
    /// this with the same builder sequence.
    pub fn register_stats(builder: StatisticsBuilder) -> StatisticsBuilder {
        builder
            .add_variable("http_cache_hits")
            .add_variable("http_cache_misses")
            .add_variable("http_cache_inserts")
            .add_variable("http_cache_expirations")
            .add_variable("http_cache_not_cacheable")
            .add_variable("http_cache_recent_fetch_failures")
    }

    pub fn new(backend: Arc<dyn CacheBackend>, timer: SharedTimer, stats: &Statistics) -> Self {
        Self {
            backend,
            timer,
            stats: HttpCacheStats {
                hits: stats.find_variable("http_cache_hits"),
                misses: stats.find_variable("http_cache_misses"),
                inserts: stats.find_variable("http_cache_inserts"),
                expirations: stats.find_variable("http_cache_expirations"),
                not_cacheable: stats.find_variable("http_cache_not_cacheable"),
                recent_fetch_failures: stats.find_variable("http_cache_recent_fetch_failures"),
            },
            implicit_ttl_ms: DEFAULT_IMPLICIT_CACHE_TTL_MS,
            remember_not_cacheable_ttl_ms: DEFAULT_REMEMBER_NOT_CACHEABLE_TTL_MS,
            remember_fetch_failed_ttl_ms: DEFAULT_REMEMBER_FETCH_FAILED_TTL_MS,
            min_compress_bytes: None,
        }
    }

    pub fn set_implicit_ttl_ms(&mut self, ttl_ms: i64) {
        self.implicit_ttl_ms = ttl_ms;
    }

    pub fn set_remember_not_cacheable_ttl_ms(&mut self, ttl_ms: i64) {
        self.remember_not_cacheable_ttl_ms = ttl_ms;
    }

    pub fn set_remember_fetch_failed_ttl_ms(&mut self, ttl_ms: i64) {
        self.remember_fetch_failed_ttl_ms = ttl_ms;
    }

    /// Enable compression of bodies at least `min_bytes` long.
    pub fn set_compression(&mut self, min_bytes: Option<usize>) {
        self.min_compress_bytes = min_bytes;
    }

    /// Insert a response if its headers permit caching; uncacheable
    /// responses are silently dropped.
    pub async fn put(&self, key: &str, headers: &ResponseHeaders, body: &[u8]) {
        let now_us = self.timer.now_us();
        let policy = CachePolicy::from_headers(headers, now_us, self.implicit_ttl_ms);
        if !policy.cacheable {
            trace!("Dropping uncacheable put for {key}");
            self.stats.not_cacheable.add(1);
            return;
        }

        let mut stored_headers = headers.clone();
        stored_headers.replace(EXPIRES_US_HEADER, policy.expiration_us.to_string());

        let mut stored_body = body;
        let compressed;
        if let Some(min) = self.min_compress_bytes {
            if let Some(out) = compress::maybe_compress(body, min) {
                compressed = out;
                stored_body = &compressed;
                stored_headers.replace(GZIP_HEADER, "1");
            }
        }

        let mut value = HttpValue::new();
        if value.set_headers(&stored_headers).is_err() || value.write(stored_body).is_err() {
            // Regions past the u32 prefix cannot be represented; treat
            // like an uncacheable response.
            debug!("Dropping oversized put for {key}");
            self.stats.not_cacheable.add(1);
            return;
        }
        self.backend.put(key, value.share()).await;
        self.stats.inserts.add(1);
    }

    /// Look up a response, re-evaluating freshness at the current
    /// wall-clock time.
    pub async fn get(&self, key: &str) -> HttpCacheResult {
        let lookup = self.backend.get(key).await;
        if !lookup.is_found() {
            self.stats.misses.add(1);
            return HttpCacheResult::NotFound;
        }

        let mut value = HttpValue::new();
        if !value.link(&lookup.value) {
            // Decode failure collapses to a miss; the bad entry is left
            // for replacement, not rewritten.
            debug!("Undecodable cache entry for {key}");
            self.stats.misses.add(1);
            return HttpCacheResult::NotFound;
        }
        let Ok(mut headers) = value.extract_headers() else {
            self.stats.misses.add(1);
            return HttpCacheResult::NotFound;
        };

        let now_us = self.timer.now_us();
        let expires_us = headers
            .lookup_first(EXPIRES_US_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        if let Some(kind) = headers.lookup_first(SENTINEL_HEADER).map(str::to_string) {
            if now_us >= expires_us {
                self.stats.misses.add(1);
                return HttpCacheResult::NotFound;
            }
            return match kind.as_str() {
                SENTINEL_FETCH_FAILED => {
                    self.stats.recent_fetch_failures.add(1);
                    HttpCacheResult::RecentFetchFailed
                }
                _ => {
                    self.stats.not_cacheable.add(1);
                    HttpCacheResult::RecentNotCacheable
                }
            };
        }

        if now_us >= expires_us {
            trace!("Expired cache entry for {key}");
            self.stats.expirations.add(1);
            self.stats.misses.add(1);
            return HttpCacheResult::NotFound;
        }

        let Ok(raw_body) = value.extract_contents() else {
            self.stats.misses.add(1);
            return HttpCacheResult::NotFound;
        };
        let body = if headers.lookup_first(GZIP_HEADER).is_some() {
            match compress::decompress(raw_body.as_slice()) {
                Ok(inflated) => pagecore_base::SharedBuffer::from(inflated),
                Err(_) => {
                    self.stats.misses.add(1);
                    return HttpCacheResult::NotFound;
                }
            }
        } else {
            raw_body
        };

        headers.remove_all(EXPIRES_US_HEADER);
        headers.remove_all(GZIP_HEADER);
        self.stats.hits.add(1);
        HttpCacheResult::Found { headers, body }
    }

    /// Record that `key` is not cacheable so retries stay bounded.
    pub async fn remember_not_cacheable(&self, key: &str) {
        self.put_sentinel(key, SENTINEL_NOT_CACHEABLE, self.remember_not_cacheable_ttl_ms)
            .await;
    }

    /// Record that an origin fetch for `key` failed.
    pub async fn remember_fetch_failed(&self, key: &str) {
        self.put_sentinel(key, SENTINEL_FETCH_FAILED, self.remember_fetch_failed_ttl_ms)
            .await;
    }

    async fn put_sentinel(&self, key: &str, kind: &str, ttl_ms: i64) {
        let expires_us = self.timer.now_us() + ttl_ms * 1000;
        let mut headers = ResponseHeaders::new(204, "No Content");
        headers.add(SENTINEL_HEADER, kind);
        headers.add(EXPIRES_US_HEADER, expires_us.to_string());
        let mut value = HttpValue::new();
        if value.set_headers(&headers).is_ok() && value.write(b"").is_ok() {
            self.backend.put(key, value.share()).await;
        }
    }

    pub async fn delete(&self, key: &str) {
        self.backend.delete(key).await;
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InMemoryCache;
    use pagecore_base::timer::MockTimer;
    use pagecore_base::{SharedBuffer, Statistics};

    const T0_US: i64 = 1_600_000_000_000_000;

    struct Fixture {
        cache: HttpCache,
        timer: Arc<MockTimer>,
        stats: Statistics,
    }

    fn fixture() -> Fixture {
        let stats = HttpCache::register_stats(Statistics::builder()).local();
        let timer = Arc::new(MockTimer::new(T0_US));
        let backend = Arc::new(InMemoryCache::new("mem"));
        let cache = HttpCache::new(backend, timer.clone(), &stats);
        Fixture { cache, timer, stats }
    }

    fn cacheable_headers() -> ResponseHeaders {
        let mut h = ResponseHeaders::new(200, "OK");
        h.add("Cache-Control", "max-age=300");
        h.add("Content-Type", "text/html");
        h
    }

    fn counter(stats: &Statistics, name: &str) -> i64 {
        stats.find_variable(name).get()
    }

    #[tokio::test]
    async fn test_fresh_insert_fresh_read() {
        let f = fixture();
        f.cache.put("k1", &cacheable_headers(), b"hello").await;
        f.timer.advance_us(100 * 1_000_000);

        match f.cache.get("k1").await {
            HttpCacheResult::Found { headers, body } => {
                assert_eq!(body.as_slice(), b"hello");
                assert_eq!(headers, cacheable_headers());
            }
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(counter(&f.stats, "http_cache_hits"), 1);
        assert_eq!(counter(&f.stats, "http_cache_misses"), 0);
    }

    #[tokio::test]
    async fn test_expiry() {
        let f = fixture();
        f.cache.put("k1", &cacheable_headers(), b"hello").await;
        f.timer.advance_us(301 * 1_000_000);

        assert!(!f.cache.get("k1").await.is_found());
        assert_eq!(counter(&f.stats, "http_cache_hits"), 0);
        assert_eq!(counter(&f.stats, "http_cache_misses"), 1);
        assert_eq!(counter(&f.stats, "http_cache_expirations"), 1);
    }

    #[tokio::test]
    async fn test_remember_not_cacheable() {
        let f = fixture();
        f.cache.remember_not_cacheable("k2").await;
        assert!(matches!(
            f.cache.get("k2").await,
            HttpCacheResult::RecentNotCacheable
        ));
        f.timer.advance_us(301 * 1_000_000);
        assert!(matches!(f.cache.get("k2").await, HttpCacheResult::NotFound));
    }

    #[tokio::test]
    async fn test_remember_fetch_failed() {
        let f = fixture();
        f.cache.remember_fetch_failed("k3").await;
        assert!(matches!(
            f.cache.get("k3").await,
            HttpCacheResult::RecentFetchFailed
        ));
        assert_eq!(counter(&f.stats, "http_cache_recent_fetch_failures"), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_put_is_dropped() {
        let f = fixture();
        let mut headers = ResponseHeaders::new(200, "OK");
        headers.add("Cache-Control", "no-store");
        f.cache.put("k", &headers, b"secret").await;
        assert!(!f.cache.get("k").await.is_found());
        assert_eq!(counter(&f.stats, "http_cache_inserts"), 0);
        assert_eq!(counter(&f.stats, "http_cache_not_cacheable"), 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let f = fixture();
        f.cache
            .backend()
            .put("bad", SharedBuffer::from_bytes(b"not an http value"))
            .await;
        assert!(!f.cache.get("bad").await.is_found());
        assert_eq!(counter(&f.stats, "http_cache_misses"), 1);
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let mut f = fixture();
        f.cache.set_compression(Some(64));
        let body = vec![b'x'; 8192];
        f.cache.put("big", &cacheable_headers(), &body).await;

        match f.cache.get("big").await {
            HttpCacheResult::Found { headers, body: got } => {
                assert_eq!(got.as_slice(), &body[..]);
                // Internal markers must not leak.
                assert!(headers.lookup_first("X-Pagecore-Gzip").is_none());
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }
}
