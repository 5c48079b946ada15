//! Disk-backed cache with periodic cleanup
//!
//! The slowest, largest layer. Keys hash to sharded paths
//! (`ab/cd/<hex>`) so no directory grows unbounded. Writes go through a
//! temp file and rename, so a reader never sees a partial entry.
//! Cleanup runs at most once per configured interval, guarded by a
//! cross-process named lock, and evicts oldest entries first until the
//! tree fits the size and inode budgets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use pagecore_base::timer::SharedTimer;
use pagecore_base::{FileSystemLockManager, SharedBuffer};

use crate::interface::{CacheBackend, Lookup};

/// Operations slower than this are logged at warn level.
pub const DEFAULT_SLOW_FILE_LATENCY_THRESHOLD_US: i64 = 200_000;

/// Name of the cross-process lock guarding cleanup passes.
const CLEAN_LOCK_NAME: &str = "file_cache_clean";

/// Extension for in-flight writes, renamed into place on completion.
const TEMP_EXTENSION: &str = "temp";

/// Limits for the cleanup pass.
#[derive(Clone, Copy, Debug)]
pub struct CleanPolicy {
    /// Target on-disk size in kilobytes; 0 disables the size check.
    pub clean_size_kb: u64,
    /// Target entry count; 0 disables the inode check.
    pub clean_inode_limit: u64,
    /// Minimum interval between cleanup passes.
    pub clean_interval_ms: i64,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            clean_size_kb: 100 * 1024,
            clean_inode_limit: 50_000,
            clean_interval_ms: 3_600_000,
        }
    }
}

/// Disk cache rooted at one directory.
pub struct FileCache {
    name: String,
    root: PathBuf,
    timer: SharedTimer,
    locks: Arc<FileSystemLockManager>,
    policy: CleanPolicy,
    slow_latency_threshold_us: i64,
    last_clean_us: AtomicI64,
    shutdown: AtomicBool,
}

impl FileCache {
    pub fn new(
        root: impl Into<PathBuf>,
        timer: SharedTimer,
        locks: Arc<FileSystemLockManager>,
        policy: CleanPolicy,
    ) -> Self {
        Self {
            name: "file".to_string(),
            root: root.into(),
            timer,
            locks,
            policy,
            slow_latency_threshold_us: DEFAULT_SLOW_FILE_LATENCY_THRESHOLD_US,
            last_clean_us: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn with_slow_latency_threshold_us(mut self, us: i64) -> Self {
        self.slow_latency_threshold_us = us;
        self
    }

    /// Sharded path for `key`: two 2-hex-digit directories then the
    /// full digest.
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(&digest[..2]).join(&digest[2..4]).join(&digest)
    }

    fn log_if_slow(&self, op: &str, key: &str, started_us: i64) {
        let elapsed = self.timer.monotonic_us() - started_us;
        if elapsed > self.slow_latency_threshold_us {
            warn!("Slow file cache {op} for {key}: {elapsed} us");
        }
    }

    /// Run a cleanup pass if one is due. Returns true when a pass
    /// actually ran. Safe to call from every put; the interval check
    /// and the named lock keep it rare and exclusive.
    pub async fn maybe_clean(&self) -> bool {
        let now_us = self.timer.now_us();
        let last = self.last_clean_us.load(Ordering::Acquire);
        if now_us - last < self.policy.clean_interval_ms * 1000 {
            return false;
        }
        match self.locks.try_lock(CLEAN_LOCK_NAME) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!("File cache clean lock failed: {e}");
                return false;
            }
        }
        self.last_clean_us.store(now_us, Ordering::Release);
        let ran = self.clean_once().await;
        if let Err(e) = self.locks.unlock(CLEAN_LOCK_NAME) {
            warn!("File cache clean unlock failed: {e}");
        }
        ran
    }

    /// One full scan-and-evict pass, oldest modification time first.
    async fn clean_once(&self) -> bool {
        let root = self.root.clone();
        let policy = self.policy;
        // The scan walks the whole tree; keep it off the async runtime.
        let result = tokio::task::spawn_blocking(move || clean_tree(&root, policy)).await;
        match result {
            Ok(Ok(removed)) => {
                if removed > 0 {
                    debug!("File cache cleanup removed {removed} entries");
                }
                true
            }
            Ok(Err(e)) => {
                warn!("File cache cleanup failed: {e}");
                false
            }
            Err(e) => {
                warn!("File cache cleanup task panicked: {e}");
                false
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CacheBackend for FileCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Lookup {
        if self.shutdown.load(Ordering::Acquire) {
            return Lookup::not_found();
        }
        let started = self.timer.monotonic_us();
        let path = self.entry_path(key);
        let lookup = match tokio::fs::read(&path).await {
            Ok(bytes) => Lookup::found(SharedBuffer::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Lookup::not_found(),
            Err(e) => {
                warn!("File cache read failed for {key}: {e}");
                Lookup::not_found()
            }
        };
        self.log_if_slow("get", key, started);
        lookup
    }

    async fn put(&self, key: &str, value: SharedBuffer) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let started = self.timer.monotonic_us();
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("File cache mkdir failed for {key}: {e}");
                return;
            }
        }
        // Write-then-rename keeps concurrent readers off partial data.
        let temp = path.with_extension(TEMP_EXTENSION);
        let write = async {
            tokio::fs::write(&temp, value.as_slice()).await?;
            tokio::fs::rename(&temp, &path).await
        };
        if let Err(e) = write.await {
            warn!("File cache write failed for {key}: {e}");
            let _ = tokio::fs::remove_file(&temp).await;
        } else {
            trace!("File cache wrote {} bytes for {key}", value.len());
        }
        self.log_if_slow("put", key, started);
        self.maybe_clean().await;
    }

    async fn delete(&self, key: &str) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("File cache delete failed for {key}: {e}"),
        }
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn shut_down(&self) {
        debug!("File cache at {} shutting down", self.root.display());
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Scan `root`, and when over budget delete entries oldest-mtime first
/// until both budgets are met. Returns the number of entries removed.
fn clean_tree(root: &Path, policy: CleanPolicy) -> std::io::Result<usize> {
    let mut entries: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    let mut total_bytes = 0u64;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().is_some_and(|e| e == TEMP_EXTENSION) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        total_bytes += meta.len();
        entries.push((entry.into_path(), mtime, meta.len()));
    }

    let size_limit = policy.clean_size_kb.saturating_mul(1024);
    let over_size = policy.clean_size_kb > 0 && total_bytes > size_limit;
    let over_inodes =
        policy.clean_inode_limit > 0 && entries.len() as u64 > policy.clean_inode_limit;
    if !over_size && !over_inodes {
        return Ok(0);
    }

    entries.sort_by_key(|(_, mtime, _)| *mtime);
    let mut removed = 0usize;
    let mut remaining_bytes = total_bytes;
    let mut remaining_count = entries.len() as u64;
    for (path, _, len) in entries {
        let size_ok = policy.clean_size_kb == 0 || remaining_bytes <= size_limit;
        let inode_ok = policy.clean_inode_limit == 0 || remaining_count <= policy.clean_inode_limit;
        if size_ok && inode_ok {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
            remaining_bytes = remaining_bytes.saturating_sub(len);
            remaining_count -= 1;
        }
    }
    Ok(removed)
}
