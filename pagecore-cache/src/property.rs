//! Cohort-grouped per-URL property storage
//!
//! Small attributes about a URL (rendered image dimensions, critical
//! CSS fingerprints) are grouped into cohorts expected to change at
//! similar rates. A page read issues one `multi_get` across all cohort
//! keys; each cohort is written back independently so fast-moving
//! cohorts do not force rewrites of slow ones. Every property tracks a
//! 64-write sliding mask of whether recent writes changed its value,
//! from which stability is derived.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use pagecore_base::SharedBuffer;
use pagecore_base::timer::SharedTimer;

use crate::interface::CacheBackend;
use crate::{Error, Result};

/// Key prefix for all property-cache entries.
const CACHE_KEY_PREFIX: &str = "PCACHE";

/// Width of the update mask: how many recent writes are remembered.
pub const STABILITY_WINDOW: u32 = 64;

/// Default stability threshold, in mutations per 1000 writes.
pub const DEFAULT_MUTATIONS_PER_1000_THRESHOLD: u64 = 300;

/// A named group of properties stored and written together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cohort {
    name: String,
}

impl Cohort {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One property value with its write history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyValue {
    bytes: Vec<u8>,
    write_timestamp_us: i64,
    update_mask: u64,
    num_writes: u32,
}

impl PropertyValue {
    fn new(bytes: Vec<u8>, now_us: i64) -> Self {
        // The first write is itself a change; the mask starts with one
        // bit shifted in so a brand-new property reads as volatile.
        Self {
            bytes,
            write_timestamp_us: now_us,
            update_mask: 1,
            num_writes: 1,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn write_timestamp_us(&self) -> i64 {
        self.write_timestamp_us
    }

    pub fn update_mask(&self) -> u64 {
        self.update_mask
    }

    /// Shift the change bit for a new write into the mask.
    fn record_write(&mut self, bytes: Vec<u8>, now_us: i64) {
        let changed = self.bytes != bytes;
        self.update_mask = (self.update_mask << 1) | u64::from(changed);
        self.num_writes = self.num_writes.saturating_add(1);
        self.bytes = bytes;
        self.write_timestamp_us = now_us;
    }

    /// True when the fraction of value-changing writes in the window is
    /// strictly below `mutations_per_1000`.
    pub fn is_stable(&self, mutations_per_1000: u64) -> bool {
        let window = self.num_writes.clamp(1, STABILITY_WINDOW) as u64;
        let changes = u64::from(self.update_mask.count_ones());
        changes * 1000 < mutations_per_1000 * window
    }

    /// True when the value's last write is older than `ttl_ms`. The TTL
    /// is caller-supplied because it is usually derived from other
    /// configuration.
    pub fn is_expired(&self, now_us: i64, ttl_ms: i64) -> bool {
        now_us - self.write_timestamp_us > ttl_ms * 1000
    }
}

/// In-flight view of every property for one URL key.
///
/// Pages are read-before-written: a cohort write on a page that was
/// never read is a programming error and is rejected.
pub struct PropertyPage {
    key: String,
    was_read: bool,
    read_succeeded: bool,
    values: HashMap<String, HashMap<String, PropertyValue>>,
}

impl PropertyPage {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            was_read: false,
            read_succeeded: false,
            values: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn was_read(&self) -> bool {
        self.was_read
    }

    /// True when every cohort lookup decoded successfully.
    pub fn read_succeeded(&self) -> bool {
        self.read_succeeded
    }

    /// Current value of `(cohort, name)`, if any.
    pub fn value(&self, cohort: &Cohort, name: &str) -> Option<&PropertyValue> {
        self.values.get(cohort.name())?.get(name)
    }

    fn cohort_values(&self, cohort: &Cohort) -> Option<&HashMap<String, PropertyValue>> {
        self.values.get(cohort.name())
    }
}

/// Per-URL, per-cohort attribute store with stability tracking.
pub struct PropertyCache {
    backend: Arc<dyn CacheBackend>,
    timer: SharedTimer,
    cohorts: Vec<Cohort>,
    enabled: bool,
}

impl PropertyCache {
    pub fn new(backend: Arc<dyn CacheBackend>, timer: SharedTimer) -> Self {
        Self {
            backend,
            timer,
            cohorts: Vec::new(),
            enabled: true,
        }
    }

    /// Register a cohort. Cohorts are process-wide labels; property
    /// names are unique within a cohort.
    pub fn add_cohort(&mut self, name: impl Into<String>) -> Cohort {
        let cohort = Cohort { name: name.into() };
        if !self.cohorts.contains(&cohort) {
            self.cohorts.push(cohort.clone());
        }
        cohort
    }

    pub fn get_cohort(&self, name: &str) -> Option<&Cohort> {
        self.cohorts.iter().find(|c| c.name == name)
    }

    pub fn cohorts(&self) -> &[Cohort] {
        &self.cohorts
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn cohort_key(&self, cohort: &Cohort, page_key: &str) -> String {
        format!("{CACHE_KEY_PREFIX}/{}/{page_key}", cohort.name)
    }

    /// Populate `page` with one batched lookup across every registered
    /// cohort. Marks the page read regardless of hit/miss so that
    /// writes are legal afterwards; returns overall success.
    pub async fn read(&self, page: &mut PropertyPage) -> bool {
        page.was_read = true;
        if !self.enabled || self.cohorts.is_empty() {
            page.read_succeeded = self.enabled;
            return page.read_succeeded;
        }

        let keys: Vec<String> = self
            .cohorts
            .iter()
            .map(|c| self.cohort_key(c, &page.key))
            .collect();
        let lookups = self.backend.multi_get(&keys).await;

        let mut all_decoded = true;
        for (cohort, lookup) in self.cohorts.iter().zip(lookups) {
            if !lookup.is_found() {
                continue;
            }
            match decode_cohort(lookup.value.as_slice()) {
                Ok(values) => {
                    page.values.insert(cohort.name.clone(), values);
                }
                Err(e) => {
                    // Decode failure is a per-cohort miss; the bad
                    // entry is not rewritten.
                    debug!("Corrupt cohort {} for {}: {e}", cohort.name, page.key);
                    all_decoded = false;
                }
            }
        }
        page.read_succeeded = all_decoded;
        all_decoded
    }

    /// Update `(cohort, name)` on the page, recording whether the bytes
    /// changed and stamping the write time.
    pub fn update_value(
        &self,
        page: &mut PropertyPage,
        cohort: &Cohort,
        name: &str,
        bytes: &[u8],
    ) {
        let now_us = self.timer.now_us();
        let cohort_map = page.values.entry(cohort.name.clone()).or_default();
        match cohort_map.get_mut(name) {
            Some(value) => value.record_write(bytes.to_vec(), now_us),
            None => {
                cohort_map.insert(name.to_string(), PropertyValue::new(bytes.to_vec(), now_us));
            }
        }
    }

    /// Persist one cohort of `page`. Unchanged properties participate
    /// so every stability window advances uniformly.
    pub async fn write_cohort(&self, cohort: &Cohort, page: &PropertyPage) -> Result<()> {
        if !page.was_read {
            // Read-before-write is a hard requirement; this indicates a
            // bug in the caller.
            warn!("write_cohort({}) on unread page {}", cohort.name, page.key);
            return Err(Error::PageNotRead(cohort.name.clone()));
        }
        if self.get_cohort(&cohort.name).is_none() {
            return Err(Error::UnknownCohort(cohort.name.clone()));
        }
        if !self.enabled {
            return Ok(());
        }
        let empty = HashMap::new();
        let values = page.cohort_values(cohort).unwrap_or(&empty);
        let payload = encode_cohort(values);
        self.backend
            .put(&self.cohort_key(cohort, &page.key), SharedBuffer::from(payload))
            .await;
        Ok(())
    }

    pub fn timer(&self) -> &SharedTimer {
        &self.timer
    }
}

fn encode_cohort(values: &HashMap<String, PropertyValue>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    // Deterministic ordering keeps repeated serializations byte-equal.
    let mut names: Vec<&String> = values.keys().collect();
    names.sort();
    for name in names {
        let value = &values[name];
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&value.bytes);
        out.extend_from_slice(&value.write_timestamp_us.to_le_bytes());
        out.extend_from_slice(&value.update_mask.to_le_bytes());
        out.extend_from_slice(&value.num_writes.to_le_bytes());
    }
    out
}

fn decode_cohort(bytes: &[u8]) -> Result<HashMap<String, PropertyValue>> {
    let mut cursor = 0usize;
    let count = read_u32(bytes, &mut cursor)? as usize;
    let mut out = HashMap::with_capacity(count.min(64));
    for _ in 0..count {
        let name = String::from_utf8(read_chunk(bytes, &mut cursor)?.to_vec())
            .map_err(|_| Error::MalformedValue("non-UTF-8 property name".into()))?;
        let value_bytes = read_chunk(bytes, &mut cursor)?.to_vec();
        let write_timestamp_us = i64::from_le_bytes(read_array(bytes, &mut cursor)?);
        let update_mask = u64::from_le_bytes(read_array(bytes, &mut cursor)?);
        let num_writes = u32::from_le_bytes(read_array(bytes, &mut cursor)?);
        out.insert(
            name,
            PropertyValue {
                bytes: value_bytes,
                write_timestamp_us,
                update_mask,
                num_writes,
            },
        );
    }
    Ok(out)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(bytes, cursor)?))
}

fn read_array<const N: usize>(bytes: &[u8], cursor: &mut usize) -> Result<[u8; N]> {
    let end = cursor
        .checked_add(N)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| Error::MalformedValue("truncated cohort record".into()))?;
    let mut raw = [0u8; N];
    raw.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(raw)
}

fn read_chunk<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32(bytes, cursor)? as usize;
    let end = cursor
        .checked_add(len)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| Error::MalformedValue("truncated cohort chunk".into()))?;
    let chunk = &bytes[*cursor..end];
    *cursor = end;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InMemoryCache;
    use pagecore_base::timer::{MockTimer, Timer};

    struct Fixture {
        pcache: PropertyCache,
        timer: Arc<MockTimer>,
        dom: Cohort,
        beacon: Cohort,
    }

    fn fixture() -> Fixture {
        let timer = Arc::new(MockTimer::new(1_000_000));
        let backend = Arc::new(InMemoryCache::new("mem"));
        let mut pcache = PropertyCache::new(backend, timer.clone());
        let dom = pcache.add_cohort("dom");
        let beacon = pcache.add_cohort("beacon");
        Fixture {
            pcache,
            timer,
            dom,
            beacon,
        }
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let f = fixture();
        let mut page = PropertyPage::new("http://example.com/");
        assert!(f.pcache.read(&mut page).await);
        f.pcache.update_value(&mut page, &f.dom, "height", b"600");
        f.pcache.write_cohort(&f.dom, &page).await.unwrap();

        let mut reread = PropertyPage::new("http://example.com/");
        assert!(f.pcache.read(&mut reread).await);
        let value = reread.value(&f.dom, "height").unwrap();
        assert_eq!(value.bytes(), b"600");
    }

    #[tokio::test]
    async fn test_write_without_read_is_rejected() {
        let f = fixture();
        let page = PropertyPage::new("http://example.com/");
        assert!(matches!(
            f.pcache.write_cohort(&f.dom, &page).await,
            Err(Error::PageNotRead(_))
        ));
    }

    #[tokio::test]
    async fn test_cohorts_are_independent() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        f.pcache.update_value(&mut page, &f.dom, "a", b"1");
        f.pcache.update_value(&mut page, &f.beacon, "b", b"2");
        // Only the dom cohort is persisted.
        f.pcache.write_cohort(&f.dom, &page).await.unwrap();

        let mut reread = PropertyPage::new("k");
        f.pcache.read(&mut reread).await;
        assert!(reread.value(&f.dom, "a").is_some());
        assert!(reread.value(&f.beacon, "b").is_none());
    }

    #[tokio::test]
    async fn test_stability_mask_alternating_writes() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        for i in 0..100u32 {
            let bytes = if i % 2 == 0 { b"aaa".as_ref() } else { b"bbb".as_ref() };
            f.pcache.update_value(&mut page, &f.dom, "flip", bytes);
        }
        let value = page.value(&f.dom, "flip").unwrap();
        // Every write changed the value; the 64-bit window is
        // saturated.
        assert_eq!(value.update_mask().count_ones(), STABILITY_WINDOW);
        assert!(!value.is_stable(DEFAULT_MUTATIONS_PER_1000_THRESHOLD));
    }

    #[tokio::test]
    async fn test_first_write_counts_as_a_change() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        f.pcache.update_value(&mut page, &f.dom, "fresh", b"v");
        let value = page.value(&f.dom, "fresh").unwrap();
        assert_eq!(value.update_mask().count_ones(), 1);
        // One write, one change: maximally volatile, not stable.
        assert!(!value.is_stable(DEFAULT_MUTATIONS_PER_1000_THRESHOLD));
    }

    #[tokio::test]
    async fn test_stability_threshold_is_exclusive() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        // 10 writes, 3 of which change the value (including the first).
        f.pcache.update_value(&mut page, &f.dom, "p", b"a");
        for _ in 0..7 {
            f.pcache.update_value(&mut page, &f.dom, "p", b"a");
        }
        f.pcache.update_value(&mut page, &f.dom, "p", b"b");
        f.pcache.update_value(&mut page, &f.dom, "p", b"c");
        let value = page.value(&f.dom, "p").unwrap();
        assert_eq!(value.update_mask().count_ones(), 3);
        // 300/1000 of 10 writes is exactly 3 changes; the ratio must be
        // strictly below the threshold.
        assert!(!value.is_stable(300));
        assert!(value.is_stable(301));
    }

    #[tokio::test]
    async fn test_constant_writes_are_stable() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        for _ in 0..100 {
            f.pcache.update_value(&mut page, &f.dom, "fixed", b"same");
        }
        let value = page.value(&f.dom, "fixed").unwrap();
        assert_eq!(value.update_mask(), 0);
        assert!(value.is_stable(DEFAULT_MUTATIONS_PER_1000_THRESHOLD));
    }

    #[tokio::test]
    async fn test_expiration_uses_caller_ttl() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        f.pcache.update_value(&mut page, &f.dom, "p", b"v");
        let now = f.timer.now_us();
        let value = page.value(&f.dom, "p").unwrap();
        assert!(!value.is_expired(now + 500_000, 1000));
        assert!(value.is_expired(now + 1_500_000, 1000));
    }

    #[tokio::test]
    async fn test_corrupt_cohort_payload_is_a_miss() {
        let f = fixture();
        f.pcache
            .backend
            .put("PCACHE/dom/k", SharedBuffer::from_bytes(b"\xff\xff\xff\xffgarbage"))
            .await;
        let mut page = PropertyPage::new("k");
        assert!(!f.pcache.read(&mut page).await);
        assert!(page.was_read());
        assert!(page.value(&f.dom, "anything").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_properties_participate_in_writes() {
        let f = fixture();
        let mut page = PropertyPage::new("k");
        f.pcache.read(&mut page).await;
        f.pcache.update_value(&mut page, &f.dom, "a", b"1");
        f.pcache.update_value(&mut page, &f.dom, "b", b"2");
        f.pcache.write_cohort(&f.dom, &page).await.unwrap();

        let mut page2 = PropertyPage::new("k");
        f.pcache.read(&mut page2).await;
        // Touch only "a"; "b" still rides along in the cohort write.
        f.pcache.update_value(&mut page2, &f.dom, "a", b"1x");
        f.pcache.write_cohort(&f.dom, &page2).await.unwrap();

        let mut page3 = PropertyPage::new("k");
        f.pcache.read(&mut page3).await;
        assert_eq!(page3.value(&f.dom, "b").unwrap().bytes(), b"2");
    }
}
