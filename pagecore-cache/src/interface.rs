//! Asynchronous cache backend contract
//!
//! Every cache layer implements [`CacheBackend`]: the in-process LRU,
//! the file cache, and the composites built on top of them. Lookups
//! resolve to exactly one [`Lookup`]; a candidate validator may reject
//! a hit, in which case the layer reports `NotFound` upward. After
//! `shut_down` every get reports `NotFound` and writes are silently
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use pagecore_base::SharedBuffer;

/// Terminal state of a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// The key resolved to a value the caller may inspect.
    Available,
    /// The key is absent, expired, rejected, or the cache is shut down.
    NotFound,
}

/// Result of a cache lookup.
#[derive(Clone, Debug)]
pub struct Lookup {
    pub state: KeyState,
    pub value: SharedBuffer,
}

impl Lookup {
    pub fn found(value: SharedBuffer) -> Self {
        Self {
            state: KeyState::Available,
            value,
        }
    }

    pub fn not_found() -> Self {
        Self {
            state: KeyState::NotFound,
            value: SharedBuffer::new(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.state == KeyState::Available
    }
}

/// Accept/reject verdict applied to a retrieved candidate before it is
/// reported to the caller. Rejection collapses to `NotFound`.
pub trait CandidateValidator: Send + Sync {
    fn validate(&self, key: &str, value: &SharedBuffer) -> bool;
}

/// Validator accepting every candidate.
pub struct AcceptAll;

impl CandidateValidator for AcceptAll {
    fn validate(&self, _key: &str, _value: &SharedBuffer) -> bool {
        true
    }
}

/// Uniform asynchronous K→V contract for all cache layers.
///
/// Guarantees:
/// - exactly one [`Lookup`] per get,
/// - read-your-writes per key within one backend,
/// - post-shutdown gets report `NotFound`; puts and deletes are dropped.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short identifier used in logs and stats.
    fn name(&self) -> &str;

    /// Asynchronous lookup.
    async fn get(&self, key: &str) -> Lookup;

    /// Lookup with a candidate validator. Composite caches override
    /// this to interpose on the retrieved bytes (see the fallback
    /// cache); the default runs `get` and applies the verdict.
    async fn get_validated(&self, key: &str, validator: &dyn CandidateValidator) -> Lookup {
        let lookup = self.get(key).await;
        if lookup.is_found() && validator.validate(key, &lookup.value) {
            lookup
        } else {
            Lookup::not_found()
        }
    }

    /// Batched lookup. The default loops over `get`; backends with a
    /// batched RPC override this, and callers that care about batching
    /// (the property cache) issue it as a first-class operation.
    async fn multi_get(&self, keys: &[String]) -> Vec<Lookup> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await);
        }
        results
    }

    /// Asynchronous write.
    async fn put(&self, key: &str, value: SharedBuffer);

    /// Asynchronous delete.
    async fn delete(&self, key: &str);

    /// False while the backing store is known to be failing; callers
    /// skip unhealthy layers rather than surface errors.
    fn is_healthy(&self) -> bool {
        true
    }

    /// True when gets may block the calling thread.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Backends with bounded key length encode the key inside the value
    /// on put and declare it here.
    fn must_encode_key_in_value(&self) -> bool {
        false
    }

    /// Enter fast-reject mode: flush in-flight work as `NotFound` and
    /// drop all future writes.
    fn shut_down(&self);
}

/// Plain in-process hash map backend.
///
/// Used as the small test backend, and as the L2 stand-in when no
/// shared-memory cache is configured.
pub struct InMemoryCache {
    name: String,
    map: Mutex<HashMap<String, SharedBuffer>>,
    shutdown: AtomicBool,
}

impl InMemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Number of stored entries.
    pub fn num_entries(&self) -> usize {
        self.map.lock().len()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Lookup {
        if self.shutdown.load(Ordering::Acquire) {
            return Lookup::not_found();
        }
        match self.map.lock().get(key) {
            Some(value) => Lookup::found(value.clone()),
            None => Lookup::not_found(),
        }
    }

    async fn put(&self, key: &str, value: SharedBuffer) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.map.lock().insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.map.lock().remove(key);
    }

    fn shut_down(&self) {
        debug!("Cache {} shutting down", self.name);
        self.shutdown.store(true, Ordering::Release);
    }
}
