//! Bounded in-process LRU cache
//!
//! Entries live in an arena with stable indices; the recency list keeps
//! `prev`/`next` as indices and the hash map stores indices, giving
//! O(1) promote and evict without self-referential structures. Bytes
//! accounted per entry are `|key| + |value|`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use pagecore_base::SharedBuffer;

use crate::interface::{CacheBackend, Lookup};

const NIL: usize = usize::MAX;

struct Entry {
    key: String,
    value: SharedBuffer,
    prev: usize,
    next: usize,
}

impl Entry {
    fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Synchronous LRU cache. Callers wanting the async [`CacheBackend`]
/// surface wrap it in [`ThreadsafeLruCache`].
pub struct LruCache {
    max_bytes: usize,
    current_bytes: usize,
    arena: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,

    hits: u64,
    misses: u64,
    inserts: u64,
    deletes: u64,
    evictions: u64,
    identical_reinserts: u64,
}

impl LruCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            current_bytes: 0,
            arena: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            hits: 0,
            misses: 0,
            inserts: 0,
            deletes: 0,
            evictions: 0,
            identical_reinserts: 0,
        }
    }

    fn entry(&self, idx: usize) -> &Entry {
        self.arena[idx].as_ref().unwrap_or_else(|| unreachable!("index points at freed slot"))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.prev, e.next)
        };
        if prev != NIL {
            self.arena[prev].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.arena[next].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        {
            let e = self.arena[idx].as_mut().unwrap();
            e.prev = NIL;
            e.next = self.head;
        }
        if self.head != NIL {
            self.arena[self.head].as_mut().unwrap().prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove_index(&mut self, idx: usize) -> Entry {
        self.unlink(idx);
        let entry = self.arena[idx].take().unwrap();
        self.free.push(idx);
        self.index.remove(&entry.key);
        self.current_bytes -= entry.size();
        entry
    }

    fn allocate(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = Some(entry);
                idx
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        }
    }

    /// Look up `key`, promoting it on hit.
    pub fn get(&mut self, key: &str) -> Option<SharedBuffer> {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.promote(idx);
                self.hits += 1;
                Some(self.entry(idx).value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `key -> value`, evicting from the back as needed.
    ///
    /// Re-inserting the identical bytes only promotes; an entry larger
    /// than the whole cache is rejected outright, leaving the cache
    /// unchanged.
    pub fn put(&mut self, key: &str, value: SharedBuffer) {
        let needed = key.len() + value.len();
        if needed > self.max_bytes {
            trace!("LRU rejecting oversized entry for {key} ({needed} bytes)");
            return;
        }

        if let Some(idx) = self.index.get(key).copied() {
            if self.entry(idx).value == value {
                // Phantom re-insert: promote without evicting neighbors.
                self.promote(idx);
                self.identical_reinserts += 1;
                return;
            }
            self.remove_index(idx);
        }

        while self.current_bytes + needed > self.max_bytes {
            let victim = self.tail;
            debug_assert_ne!(victim, NIL, "byte accounting out of sync");
            let evicted = self.remove_index(victim);
            trace!("LRU evicted {} ({} bytes)", evicted.key, evicted.size());
            self.evictions += 1;
        }

        let idx = self.allocate(Entry {
            key: key.to_string(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(idx);
        self.index.insert(key.to_string(), idx);
        self.current_bytes += needed;
        self.inserts += 1;
    }

    /// Remove `key` if present.
    pub fn delete(&mut self, key: &str) {
        if let Some(idx) = self.index.get(key).copied() {
            self.remove_index(idx);
            self.deletes += 1;
        }
    }

    pub fn num_elements(&self) -> usize {
        self.index.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn inserts(&self) -> u64 {
        self.inserts
    }

    pub fn identical_reinserts(&self) -> u64 {
        self.identical_reinserts
    }

    /// Verify internal invariants: list and map are bijective and the
    /// byte total matches the sum of entry sizes. For tests.
    pub fn sanity_check(&self) -> bool {
        let mut walked = 0usize;
        let mut bytes = 0usize;
        let mut idx = self.head;
        let mut prev = NIL;
        while idx != NIL {
            let Some(entry) = self.arena[idx].as_ref() else {
                return false;
            };
            if entry.prev != prev {
                return false;
            }
            if self.index.get(&entry.key) != Some(&idx) {
                return false;
            }
            walked += 1;
            bytes += entry.size();
            prev = idx;
            idx = entry.next;
        }
        self.tail == prev && walked == self.index.len() && bytes == self.current_bytes
    }

    /// Drain every entry. Shutdown discipline should already have
    /// emptied the cache, but draining here is harmless.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
        self.current_bytes = 0;
    }
}

/// Mutex-wrapped LRU exposing the async [`CacheBackend`] contract.
pub struct ThreadsafeLruCache {
    name: String,
    inner: Mutex<LruCache>,
    shutdown: AtomicBool,
}

impl ThreadsafeLruCache {
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(LruCache::new(max_bytes)),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Run `f` against the underlying cache (stats readout, sanity
    /// checks).
    pub fn with_inner<R>(&self, f: impl FnOnce(&LruCache) -> R) -> R {
        f(&self.inner.lock())
    }
}

#[async_trait]
impl CacheBackend for ThreadsafeLruCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Lookup {
        if self.shutdown.load(Ordering::Acquire) {
            return Lookup::not_found();
        }
        match self.inner.lock().get(key) {
            Some(value) => Lookup::found(value),
            None => Lookup::not_found(),
        }
    }

    async fn put(&self, key: &str, value: SharedBuffer) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock().put(key, value);
    }

    async fn delete(&self, key: &str) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.inner.lock().delete(key);
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.inner.lock().clear();
    }
}
