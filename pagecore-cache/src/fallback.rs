//! Size-partitioning composite cache
//!
//! Routes small values to a fast cache and large values to a slow one.
//! Large entries leave a one-byte `'L'` marker in the small cache;
//! small entries carry a one-byte `'S'` suffix so that a marker can
//! never be confused with a real value. The suffix strip on read is a
//! view-local `remove_suffix`, constant time and non-mutating.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use pagecore_base::SharedBuffer;

use crate::interface::{AcceptAll, CacheBackend, CandidateValidator, Lookup};

const LARGE_MARKER: u8 = b'L';
const SMALL_SUFFIX: u8 = b'S';

/// Composite cache partitioning entries by `|key| + |value|`.
pub struct FallbackCache {
    name: String,
    small: Arc<dyn CacheBackend>,
    large: Arc<dyn CacheBackend>,
    threshold_bytes: usize,
}

impl FallbackCache {
    pub fn new(
        small: Arc<dyn CacheBackend>,
        large: Arc<dyn CacheBackend>,
        threshold_bytes: usize,
    ) -> Self {
        Self {
            name: format!("fallback({},{})", small.name(), large.name()),
            small,
            large,
            threshold_bytes,
        }
    }
}

#[async_trait]
impl CacheBackend for FallbackCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Lookup {
        self.get_validated(key, &AcceptAll).await
    }

    async fn get_validated(&self, key: &str, validator: &dyn CandidateValidator) -> Lookup {
        let lookup = self.small.get(key).await;
        if !lookup.is_found() {
            return Lookup::not_found();
        }
        let bytes = lookup.value.as_slice();
        if bytes.len() == 1 && bytes[0] == LARGE_MARKER {
            // The marker itself is a valid candidate; the real value
            // lives in the large cache and gets the caller's verdict.
            trace!("Fallback reroute to large cache for {key}");
            return self.large.get_validated(key, validator).await;
        }
        match bytes.last() {
            Some(&SMALL_SUFFIX) => {
                let mut value = lookup.value;
                value.remove_suffix(1);
                if validator.validate(key, &value) {
                    Lookup::found(value)
                } else {
                    Lookup::not_found()
                }
            }
            _ => Lookup::not_found(),
        }
    }

    async fn put(&self, key: &str, value: SharedBuffer) {
        if key.len() + value.len() >= self.threshold_bytes {
            self.small
                .put(key, SharedBuffer::from_bytes(&[LARGE_MARKER]))
                .await;
            self.large.put(key, value).await;
        } else {
            let mut tagged = value;
            tagged.append(&[SMALL_SUFFIX]);
            self.small.put(key, tagged).await;
        }
    }

    async fn delete(&self, key: &str) {
        self.small.delete(key).await;
        self.large.delete(key).await;
    }

    fn is_healthy(&self) -> bool {
        self.small.is_healthy() && self.large.is_healthy()
    }

    fn is_blocking(&self) -> bool {
        self.small.is_blocking() || self.large.is_blocking()
    }

    fn shut_down(&self) {
        self.small.shut_down();
        self.large.shut_down();
    }
}
