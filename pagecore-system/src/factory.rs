//! Root/child factory composing the cache and fetch stacks
//!
//! The root process creates shared statistics segments and cache
//! directories; children attach and build per-vhost server contexts.
//! Both sides register the same counter names in the same order, which
//! fixes the shared segment layout.

use std::sync::Arc;

use tracing::{debug, info};

use pagecore_base::sharedmem::SharedMemRuntime;
use pagecore_base::stats::{Statistics, StatisticsBuilder};
use pagecore_base::timer::{SharedTimer, SystemTimer};
use pagecore_base::FileSystemLockManager;
use pagecore_cache::file::CleanPolicy;
use pagecore_cache::{
    FallbackCache, FileCache, HttpCache, PropertyCache, ThreadsafeLruCache,
};
use pagecore_fetch::{
    ExpensiveOperationController, InPlaceRecorder, RateControllingFetcher, ReqwestUrlFetcher,
    UrlFetcher,
};

use crate::config::{SystemConfig, ValidatedConfig};
use crate::{Error, Result};

/// Shared segment holding all counters.
const STATS_SEGMENT: &str = "statistics";

/// Values at least this large (key included) go to the file cache
/// instead of the LRU.
const FALLBACK_THRESHOLD_BYTES: usize = 2048;

/// Everything one vhost needs to serve optimized traffic.
pub struct ServerContext {
    pub http_cache: Arc<HttpCache>,
    pub property_cache: PropertyCache,
    pub fetcher: Arc<dyn UrlFetcher>,
    pub recorder: Arc<InPlaceRecorder>,
    pub admission: Arc<ExpensiveOperationController>,
    pub lock_manager: Arc<FileSystemLockManager>,
    rate_limiter: Option<Arc<RateControllingFetcher>>,
}

impl ServerContext {
    /// Fast-reject mode: caches answer `NotFound`, queued fetches and
    /// expensive operations are canceled. In-flight work drains on its
    /// own.
    pub fn shut_down(&self) {
        self.http_cache.backend().shut_down();
        self.admission.shut_down();
        if let Some(limiter) = &self.rate_limiter {
            limiter.shut_down();
        }
    }
}

/// Builds statistics, caches, and fetchers from one validated config.
pub struct SystemFactory {
    config: SystemConfig,
    validated: ValidatedConfig,
    timer: SharedTimer,
    stats: Statistics,
}

impl SystemFactory {
    /// Counter registration shared by root and children. Order matters:
    /// it defines the segment layout.
    fn register_stats(builder: StatisticsBuilder) -> StatisticsBuilder {
        let builder = HttpCache::register_stats(builder);
        let builder = RateControllingFetcher::register_stats(builder);
        ExpensiveOperationController::register_stats(builder)
    }

    fn new_with_stats(config: SystemConfig, stats: Statistics) -> Result<Self> {
        let validated = config.validate()?;
        Ok(Self {
            config,
            validated,
            timer: Arc::new(SystemTimer::new()),
            stats,
        })
    }

    /// Root-process initialization: create the statistics segment and
    /// the cache directory tree.
    pub fn init_root(config: SystemConfig, runtime: &dyn SharedMemRuntime) -> Result<Self> {
        if let Some(path) = &config.file_cache_path {
            std::fs::create_dir_all(path)?;
        }
        let stats = Self::register_stats(Statistics::builder()).init_root(runtime, STATS_SEGMENT);
        info!("Root factory initialized");
        Self::new_with_stats(config, stats)
    }

    /// Child-process initialization: attach to the root's segment.
    /// Attach failure degrades counters to no-ops; it never blocks
    /// serving.
    pub fn init_child(config: SystemConfig, runtime: &dyn SharedMemRuntime) -> Result<Self> {
        let stats =
            Self::register_stats(Statistics::builder()).attach_child(runtime, STATS_SEGMENT);
        Self::new_with_stats(config, stats)
    }

    /// Single-process initialization with heap-backed counters.
    pub fn init_local(config: SystemConfig) -> Result<Self> {
        if let Some(path) = &config.file_cache_path {
            std::fs::create_dir_all(path)?;
        }
        let stats = Self::register_stats(Statistics::builder()).local();
        Self::new_with_stats(config, stats)
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn timer(&self) -> &SharedTimer {
        &self.timer
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn validated(&self) -> &ValidatedConfig {
        &self.validated
    }

    /// Build one vhost's context over the shared statistics.
    pub fn create_server_context(&self) -> Result<ServerContext> {
        let cache_path = self
            .config
            .file_cache_path
            .clone()
            .ok_or(Error::MissingOption("file_cache_path"))?;
        let lock_manager = Arc::new(FileSystemLockManager::new(&cache_path));

        let lru = Arc::new(ThreadsafeLruCache::new(
            "lru",
            (self.config.lru_cache_kb_per_process * 1024) as usize,
        ));
        let file_cache = Arc::new(
            FileCache::new(
                cache_path,
                self.timer.clone(),
                lock_manager.clone(),
                CleanPolicy {
                    clean_size_kb: self.config.file_cache_clean_size_kb,
                    clean_inode_limit: self.config.file_cache_clean_inode_limit,
                    clean_interval_ms: self.config.file_cache_clean_interval_ms,
                },
            )
            .with_slow_latency_threshold_us(self.config.slow_file_latency_threshold_us),
        );
        let backend = Arc::new(FallbackCache::new(lru, file_cache, FALLBACK_THRESHOLD_BYTES));

        let mut http_cache = HttpCache::new(backend.clone(), self.timer.clone(), &self.stats);
        if self.config.compress_metadata_cache {
            http_cache.set_compression(Some(pagecore_cache::DEFAULT_MIN_COMPRESS_BYTES));
        }
        let http_cache = Arc::new(http_cache);

        let property_cache = PropertyCache::new(backend, self.timer.clone());

        let mut fetcher_builder = ReqwestUrlFetcher::builder()
            .with_https_options(self.validated.https);
        if let Some(proxy) = &self.config.fetcher_proxy {
            fetcher_builder = fetcher_builder.with_proxy(proxy.clone());
        }
        let base_fetcher: Arc<dyn UrlFetcher> =
            Arc::new(fetcher_builder.build(self.timer.clone())?);

        let (fetcher, rate_limiter) = if self.config.rate_limit_background_fetches {
            let limiter = Arc::new(RateControllingFetcher::new(
                base_fetcher,
                &self.stats,
                pagecore_fetch::rate_limit::DEFAULT_MAX_GLOBAL_REQUESTS,
                pagecore_fetch::rate_limit::DEFAULT_PER_HOST_REQUESTS,
                self.config.popularity_contest_max_queue_size,
            ));
            (limiter.clone() as Arc<dyn UrlFetcher>, Some(limiter))
        } else {
            (base_fetcher, None)
        };

        let recorder = Arc::new(InPlaceRecorder::new(
            http_cache.clone(),
            self.config.ipro_max_response_bytes,
            self.config.ipro_max_concurrent_recordings,
        ));
        let admission = Arc::new(ExpensiveOperationController::new(
            self.config.popularity_contest_max_inflight_requests,
            &self.stats,
        ));

        debug!("Server context created");
        Ok(ServerContext {
            http_cache,
            property_cache,
            fetcher,
            recorder,
            admission,
            lock_manager,
            rate_limiter,
        })
    }

    /// Root-only teardown of the shared segment. Children must already
    /// be detached.
    pub fn destroy_root_segments(runtime: &dyn SharedMemRuntime) {
        if let Err(e) = runtime.destroy_segment(STATS_SEGMENT) {
            debug!("Statistics segment teardown: {e}");
        }
    }
}
