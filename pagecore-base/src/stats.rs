//! Process-shared counters and histograms
//!
//! Every component in the workspace reports through [`Statistics`]
//! handles. The backing store is chosen at startup:
//!
//! * `init_root` creates a shared segment (root process),
//! * `attach_child` maps an existing segment (child processes),
//! * `local` keeps everything on the heap (tests, single-process runs),
//! * attach failure degrades silently to no-op handles reporting `-1`.
//!
//! Per-variable segment layout is `(lock cell, value cell)`; histograms
//! carry a lock cell, count, sum, and a log-scale bucket array.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, warn};

use crate::sharedmem::{SharedMemRuntime, SharedSegment};

/// Buckets per histogram: one per power of two of the sample value.
const HISTOGRAM_BUCKETS: usize = 40;

/// Cells per variable: lock + value.
const VAR_CELLS: usize = 2;

/// Cells per histogram: lock + count + sum + buckets.
const HIST_HEADER_CELLS: usize = 3;
const HIST_CELLS: usize = HIST_HEADER_CELLS + HISTOGRAM_BUCKETS;

enum Cells {
    Shared(SharedSegment),
    Local(Vec<AtomicI64>),
}

impl Cells {
    fn cell(&self, index: usize) -> &AtomicI64 {
        match self {
            Cells::Shared(seg) => seg.cell(index),
            Cells::Local(v) => &v[index],
        }
    }

    fn lock(&self, index: usize) {
        match self {
            Cells::Shared(seg) => seg.lock_cell(index),
            Cells::Local(v) => {
                while v[index]
                    .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn unlock(&self, index: usize) {
        self.cell(index).store(0, Ordering::Release);
    }
}

/// Registers counter and histogram names before the backing store
/// exists. Registration order fixes the segment layout, so root and
/// children must register the same names in the same order.
#[derive(Default)]
pub struct StatisticsBuilder {
    variables: Vec<String>,
    histograms: Vec<String>,
}

impl StatisticsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter.
    pub fn add_variable(mut self, name: impl Into<String>) -> Self {
        self.variables.push(name.into());
        self
    }

    /// Register a histogram.
    pub fn add_histogram(mut self, name: impl Into<String>) -> Self {
        self.histograms.push(name.into());
        self
    }

    fn layout(&self) -> (HashMap<String, usize>, HashMap<String, usize>, usize) {
        let mut var_index = HashMap::new();
        let mut hist_index = HashMap::new();
        let mut next = 0usize;
        for name in &self.variables {
            var_index.insert(name.clone(), next);
            next += VAR_CELLS;
        }
        for name in &self.histograms {
            hist_index.insert(name.clone(), next);
            next += HIST_CELLS;
        }
        (var_index, hist_index, next)
    }

    /// Create the shared segment. Root process only.
    pub fn init_root(self, runtime: &dyn SharedMemRuntime, segment_name: &str) -> Statistics {
        let (var_index, hist_index, cells) = self.layout();
        match runtime.create_segment(segment_name, cells.max(1)) {
            Ok(seg) => {
                debug!("Statistics segment {segment_name} created ({cells} cells)");
                Statistics {
                    cells: Some(Arc::new(Cells::Shared(seg))),
                    var_index,
                    hist_index,
                }
            }
            Err(e) => {
                warn!("Statistics degraded to no-op: {e}");
                Statistics {
                    cells: None,
                    var_index,
                    hist_index,
                }
            }
        }
    }

    /// Attach to the root-created segment. Child processes.
    pub fn attach_child(self, runtime: &dyn SharedMemRuntime, segment_name: &str) -> Statistics {
        let (var_index, hist_index, cells) = self.layout();
        match runtime.attach_segment(segment_name, cells.max(1)) {
            Ok(seg) => Statistics {
                cells: Some(Arc::new(Cells::Shared(seg))),
                var_index,
                hist_index,
            },
            Err(e) => {
                warn!("Statistics attach failed, degrading to no-op: {e}");
                Statistics {
                    cells: None,
                    var_index,
                    hist_index,
                }
            }
        }
    }

    /// Heap-backed statistics for tests and single-process mode.
    pub fn local(self) -> Statistics {
        let (var_index, hist_index, cells) = self.layout();
        let mut v = Vec::with_capacity(cells);
        v.resize_with(cells, || AtomicI64::new(0));
        Statistics {
            cells: Some(Arc::new(Cells::Local(v))),
            var_index,
            hist_index,
        }
    }
}

/// Registry of counters and histograms over one backing store.
#[derive(Clone)]
pub struct Statistics {
    cells: Option<Arc<Cells>>,
    var_index: HashMap<String, usize>,
    hist_index: HashMap<String, usize>,
}

impl Statistics {
    pub fn builder() -> StatisticsBuilder {
        StatisticsBuilder::new()
    }

    /// A registry with no names and no storage; every handle is a no-op.
    pub fn noop() -> Self {
        Self {
            cells: None,
            var_index: HashMap::new(),
            hist_index: HashMap::new(),
        }
    }

    /// Look up a counter handle. Unknown names and degraded registries
    /// yield a no-op handle.
    pub fn find_variable(&self, name: &str) -> Variable {
        let base = self.var_index.get(name).copied();
        match (&self.cells, base) {
            (Some(cells), Some(base)) => Variable {
                cells: Some(Arc::clone(cells)),
                base,
            },
            _ => Variable {
                cells: None,
                base: 0,
            },
        }
    }

    /// Look up a histogram handle.
    pub fn find_histogram(&self, name: &str) -> Histogram {
        let base = self.hist_index.get(name).copied();
        match (&self.cells, base) {
            (Some(cells), Some(base)) => Histogram {
                cells: Some(Arc::clone(cells)),
                base,
            },
            _ => Histogram {
                cells: None,
                base: 0,
            },
        }
    }
}

/// Counter handle. Cheap to clone; no-op when degraded.
#[derive(Clone)]
pub struct Variable {
    cells: Option<Arc<Cells>>,
    base: usize,
}

impl Variable {
    /// A handle that records nothing and reads `-1`.
    pub fn noop() -> Self {
        Self {
            cells: None,
            base: 0,
        }
    }

    pub fn add(&self, delta: i64) {
        if let Some(cells) = &self.cells {
            cells.cell(self.base + 1).fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn set(&self, value: i64) {
        if let Some(cells) = &self.cells {
            cells.lock(self.base);
            cells.cell(self.base + 1).store(value, Ordering::Relaxed);
            cells.unlock(self.base);
        }
    }

    /// Current value, or `-1` when degraded.
    pub fn get(&self) -> i64 {
        match &self.cells {
            Some(cells) => cells.cell(self.base + 1).load(Ordering::Relaxed),
            None => -1,
        }
    }
}

/// Log-bucketed histogram handle.
#[derive(Clone)]
pub struct Histogram {
    cells: Option<Arc<Cells>>,
    base: usize,
}

impl Histogram {
    pub fn noop() -> Self {
        Self {
            cells: None,
            base: 0,
        }
    }

    fn bucket_for(value: i64) -> usize {
        let v = value.max(0) as u64;
        let b = (64 - v.leading_zeros()) as usize;
        b.min(HISTOGRAM_BUCKETS - 1)
    }

    pub fn add_sample(&self, value: i64) {
        let Some(cells) = &self.cells else { return };
        cells.lock(self.base);
        cells.cell(self.base + 1).fetch_add(1, Ordering::Relaxed);
        cells
            .cell(self.base + 2)
            .fetch_add(value.max(0), Ordering::Relaxed);
        let bucket = Self::bucket_for(value);
        cells
            .cell(self.base + HIST_HEADER_CELLS + bucket)
            .fetch_add(1, Ordering::Relaxed);
        cells.unlock(self.base);
    }

    /// Number of recorded samples, or `-1` when degraded.
    pub fn count(&self) -> i64 {
        match &self.cells {
            Some(cells) => cells.cell(self.base + 1).load(Ordering::Relaxed),
            None => -1,
        }
    }

    /// Mean of recorded samples; `0.0` when empty or degraded.
    pub fn average(&self) -> f64 {
        let Some(cells) = &self.cells else { return 0.0 };
        let count = cells.cell(self.base + 1).load(Ordering::Relaxed);
        if count <= 0 {
            return 0.0;
        }
        let sum = cells.cell(self.base + 2).load(Ordering::Relaxed);
        sum as f64 / count as f64
    }

    /// Approximate percentile (0.0..=100.0) from bucket lower bounds.
    pub fn percentile(&self, p: f64) -> f64 {
        let Some(cells) = &self.cells else { return 0.0 };
        let count = cells.cell(self.base + 1).load(Ordering::Relaxed);
        if count <= 0 {
            return 0.0;
        }
        let target = (p.clamp(0.0, 100.0) / 100.0 * count as f64).ceil() as i64;
        let mut seen = 0i64;
        for bucket in 0..HISTOGRAM_BUCKETS {
            seen += cells
                .cell(self.base + HIST_HEADER_CELLS + bucket)
                .load(Ordering::Relaxed);
            if seen >= target {
                return if bucket == 0 { 0.0 } else { (1u64 << (bucket - 1)) as f64 };
            }
        }
        0.0
    }
}

/// Duplicates every write into a per-vhost local registry and a global
/// aggregate registry, so operators can read either.
#[derive(Clone)]
pub struct SplitStatistics {
    local: Statistics,
    global: Statistics,
}

impl SplitStatistics {
    pub fn new(local: Statistics, global: Statistics) -> Self {
        Self { local, global }
    }

    pub fn find_variable(&self, name: &str) -> SplitVariable {
        SplitVariable {
            local: self.local.find_variable(name),
            global: self.global.find_variable(name),
        }
    }

    pub fn find_histogram(&self, name: &str) -> SplitHistogram {
        SplitHistogram {
            local: self.local.find_histogram(name),
            global: self.global.find_histogram(name),
        }
    }

    pub fn local(&self) -> &Statistics {
        &self.local
    }

    pub fn global(&self) -> &Statistics {
        &self.global
    }
}

/// Counter writing to both stores, reading from the vhost-local one.
#[derive(Clone)]
pub struct SplitVariable {
    local: Variable,
    global: Variable,
}

impl SplitVariable {
    pub fn add(&self, delta: i64) {
        self.local.add(delta);
        self.global.add(delta);
    }

    pub fn get(&self) -> i64 {
        self.local.get()
    }

    pub fn global_value(&self) -> i64 {
        self.global.get()
    }
}

/// Histogram writing to both stores.
#[derive(Clone)]
pub struct SplitHistogram {
    local: Histogram,
    global: Histogram,
}

impl SplitHistogram {
    pub fn add_sample(&self, value: i64) {
        self.local.add_sample(value);
        self.global.add_sample(value);
    }

    pub fn count(&self) -> i64 {
        self.local.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharedmem::{MmapSharedMem, NullSharedMem};
    use tempfile::TempDir;

    fn registered() -> StatisticsBuilder {
        Statistics::builder()
            .add_variable("cache_hits")
            .add_variable("cache_misses")
            .add_histogram("fetch_latency_us")
    }

    #[test]
    fn test_local_counters() {
        let stats = registered().local();
        let hits = stats.find_variable("cache_hits");
        hits.add(3);
        hits.add(2);
        assert_eq!(hits.get(), 5);
        hits.set(10);
        assert_eq!(hits.get(), 10);
        assert_eq!(stats.find_variable("cache_misses").get(), 0);
    }

    #[test]
    fn test_unknown_variable_degrades() {
        let stats = registered().local();
        let v = stats.find_variable("never_registered");
        v.add(5);
        assert_eq!(v.get(), -1);
    }

    #[test]
    fn test_null_runtime_degrades_silently() {
        let stats = registered().init_root(&NullSharedMem, "stats");
        let hits = stats.find_variable("cache_hits");
        hits.add(1);
        assert_eq!(hits.get(), -1);
        let hist = stats.find_histogram("fetch_latency_us");
        hist.add_sample(100);
        assert_eq!(hist.count(), -1);
    }

    #[test]
    fn test_shared_root_and_child_see_same_values() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pc.");
        let root = registered().init_root(&runtime, "global");
        root.find_variable("cache_hits").add(7);

        let child = registered().attach_child(&runtime, "global");
        assert_eq!(child.find_variable("cache_hits").get(), 7);
        child.find_variable("cache_hits").add(1);
        assert_eq!(root.find_variable("cache_hits").get(), 8);
    }

    #[test]
    fn test_histogram_stats() {
        let stats = registered().local();
        let hist = stats.find_histogram("fetch_latency_us");
        for v in [100, 200, 400, 800] {
            hist.add_sample(v);
        }
        assert_eq!(hist.count(), 4);
        assert!((hist.average() - 375.0).abs() < f64::EPSILON);
        assert!(hist.percentile(100.0) >= 512.0);
    }

    #[test]
    fn test_split_statistics_duplicate_writes() {
        let local = registered().local();
        let global = registered().local();
        let split = SplitStatistics::new(local, global);
        let hits = split.find_variable("cache_hits");
        hits.add(4);
        assert_eq!(hits.get(), 4);
        assert_eq!(hits.global_value(), 4);
        assert_eq!(split.global().find_variable("cache_hits").get(), 4);
    }
}
