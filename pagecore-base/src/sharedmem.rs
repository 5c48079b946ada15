//! Shared-memory segments for cross-process statistics
//!
//! Segments are file-backed memory mappings named
//! `<filename_prefix><object_name>`. The root process creates them and
//! is the only process allowed to destroy them; children attach to
//! existing files. When no shared-memory facility is available (tests,
//! single-process runs) the [`NullSharedMem`] runtime refuses every
//! create/attach and consumers degrade to no-op counters.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A mapped shared segment holding an array of 8-byte cells.
///
/// All access goes through [`SharedSegment::cell`], which views a cell
/// as an `AtomicI64`. The mapping is page-aligned and cells are laid
/// out back to back, so every cell is 8-byte aligned.
pub struct SharedSegment {
    map: MmapMut,
    cells: usize,
}

impl SharedSegment {
    fn new(map: MmapMut, cells: usize) -> Self {
        Self { map, cells }
    }

    /// Number of 8-byte cells in the segment.
    pub fn cells(&self) -> usize {
        self.cells
    }

    /// View cell `index` as an atomic. Panics on out-of-range index;
    /// layouts are fixed at registration time so an overrun is a
    /// programming error.
    pub fn cell(&self, index: usize) -> &AtomicI64 {
        assert!(index < self.cells, "cell {index} out of range {}", self.cells);
        let ptr = self.map.as_ptr() as *const AtomicI64;
        // The mapping is page-aligned and lives as long as `self`.
        unsafe { &*ptr.add(index) }
    }

    /// Spin until the lock cell transitions 0 -> 1.
    ///
    /// Counter updates hold the lock for a handful of instructions, so
    /// a bounded spin is adequate; a stuck holder leaves the counter
    /// wedged, not the process.
    pub fn lock_cell(&self, index: usize) {
        let cell = self.cell(index);
        while cell
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Release a lock cell taken with [`lock_cell`](Self::lock_cell).
    pub fn unlock_cell(&self, index: usize) {
        self.cell(index).store(0, Ordering::Release);
    }
}

/// Provider of shared segments.
pub trait SharedMemRuntime: Send + Sync {
    /// Create a fresh segment with room for `cells` 8-byte cells,
    /// zero-initialized. Root-process only.
    fn create_segment(&self, name: &str, cells: usize) -> Result<SharedSegment>;

    /// Attach to a segment created earlier by the root process.
    fn attach_segment(&self, name: &str, cells: usize) -> Result<SharedSegment>;

    /// Remove the backing object. Root-process only.
    fn destroy_segment(&self, name: &str) -> Result<()>;
}

/// File-backed mmap runtime.
pub struct MmapSharedMem {
    dir: PathBuf,
    filename_prefix: String,
}

impl MmapSharedMem {
    pub fn new(dir: impl Into<PathBuf>, filename_prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            filename_prefix: filename_prefix.into(),
        }
    }

    fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{name}", self.filename_prefix))
    }
}

impl SharedMemRuntime for MmapSharedMem {
    fn create_segment(&self, name: &str, cells: usize) -> Result<SharedSegment> {
        let path = self.segment_path(name);
        let size = (cells * 8) as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::SegmentCreate {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        file.set_len(size).map_err(|e| Error::SegmentCreate {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::SegmentCreate {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Created shared segment {name} ({cells} cells) at {path:?}");
        Ok(SharedSegment::new(map, cells))
    }

    fn attach_segment(&self, name: &str, cells: usize) -> Result<SharedSegment> {
        let path = self.segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::SegmentAttach {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let meta = file.metadata().map_err(|e| Error::SegmentAttach {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if meta.len() < (cells * 8) as u64 {
            return Err(Error::SegmentAttach {
                name: name.to_string(),
                reason: format!("segment too small: {} bytes", meta.len()),
            });
        }
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::SegmentAttach {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Attached shared segment {name} ({cells} cells)");
        Ok(SharedSegment::new(map, cells))
    }

    fn destroy_segment(&self, name: &str) -> Result<()> {
        let path = self.segment_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Runtime for environments without shared memory; every operation
/// fails, pushing consumers into their no-op degraded mode.
pub struct NullSharedMem;

impl SharedMemRuntime for NullSharedMem {
    fn create_segment(&self, name: &str, _cells: usize) -> Result<SharedSegment> {
        warn!("Shared memory unavailable; segment {name} not created");
        Err(Error::SharedMemUnavailable)
    }

    fn attach_segment(&self, _name: &str, _cells: usize) -> Result<SharedSegment> {
        Err(Error::SharedMemUnavailable)
    }

    fn destroy_segment(&self, _name: &str) -> Result<()> {
        Err(Error::SharedMemUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_attach_roundtrip() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pagecore.");
        let seg = runtime.create_segment("stats", 4).unwrap();
        seg.cell(0).store(42, Ordering::SeqCst);
        seg.cell(3).store(-7, Ordering::SeqCst);

        let attached = runtime.attach_segment("stats", 4).unwrap();
        assert_eq!(attached.cell(0).load(Ordering::SeqCst), 42);
        assert_eq!(attached.cell(3).load(Ordering::SeqCst), -7);
    }

    #[test]
    fn test_attach_missing_segment_fails() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pagecore.");
        assert!(runtime.attach_segment("nope", 4).is_err());
    }

    #[test]
    fn test_attach_undersized_segment_fails() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pagecore.");
        runtime.create_segment("small", 2).unwrap();
        assert!(runtime.attach_segment("small", 8).is_err());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pagecore.");
        runtime.create_segment("gone", 2).unwrap();
        runtime.destroy_segment("gone").unwrap();
        runtime.destroy_segment("gone").unwrap();
        assert!(runtime.attach_segment("gone", 2).is_err());
    }

    #[test]
    fn test_null_runtime_fails_everything() {
        let runtime = NullSharedMem;
        assert!(runtime.create_segment("x", 1).is_err());
        assert!(runtime.attach_segment("x", 1).is_err());
    }

    #[test]
    fn test_lock_cell_roundtrip() {
        let dir = TempDir::new().unwrap();
        let runtime = MmapSharedMem::new(dir.path(), "pagecore.");
        let seg = runtime.create_segment("locks", 2).unwrap();
        seg.lock_cell(0);
        assert_eq!(seg.cell(0).load(Ordering::SeqCst), 1);
        seg.unlock_cell(0);
        assert_eq!(seg.cell(0).load(Ordering::SeqCst), 0);
    }
}
