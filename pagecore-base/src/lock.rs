//! Cross-process named locks over a shared cache directory
//!
//! The primitive is atomic `mkdir`: success means acquired, `EEXIST`
//! means held elsewhere. Locks guard coarse maintenance work (cache
//! cleanup passes), never request paths. A holder that dies leaves its
//! lock directory behind; `steal_old` reclaims locks whose mtime shows
//! the holder has been gone longer than the caller's timeout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Error, Result};

/// Spin interval while waiting on a contended lock.
const LOCK_POLL_MS: u64 = 100;

/// Manager handing out named locks rooted at one directory.
pub struct FileSystemLockManager {
    base_dir: PathBuf,
}

impl FileSystemLockManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the directory representing `name`.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.lock"))
    }

    /// Attempt to take `name` without waiting.
    ///
    /// Returns `Ok(true)` on acquisition, `Ok(false)` if held, and an
    /// error for anything else (missing base directory, permissions).
    pub fn try_lock(&self, name: &str) -> Result<bool> {
        let path = self.lock_path(name);
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::LockFailed {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    /// Take `name`, spinning until it becomes free.
    pub async fn lock(&self, name: &str) -> Result<()> {
        loop {
            if self.try_lock(name)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_MS)).await;
        }
    }

    /// Take `name`, giving up after `wait_ms` milliseconds.
    pub async fn lock_timed_wait(&self, name: &str, wait_ms: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_ms);
        loop {
            if self.try_lock(name)? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(remaining.min(Duration::from_millis(LOCK_POLL_MS))).await;
        }
    }

    /// Like [`try_lock`](Self::try_lock), but first reclaims the lock if
    /// its mtime is older than `timeout_ms`. A successful steal resets
    /// the mtime, so subsequent stealers wait another full period.
    pub fn try_lock_steal_old(&self, name: &str, timeout_ms: u64) -> Result<bool> {
        if self.try_lock(name)? {
            return Ok(true);
        }
        if !self.is_older_than(name, timeout_ms)? {
            return Ok(false);
        }
        warn!("Stealing stale lock {name} (older than {timeout_ms} ms)");
        let path = self.lock_path(name);
        match std::fs::remove_dir(&path) {
            // Retry exactly once; a racing stealer may beat us to it.
            Ok(()) => self.try_lock(name),
            Err(e) if e.kind() == ErrorKind::NotFound => self.try_lock(name),
            Err(e) => Err(Error::LockFailed {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    /// Take `name`, stealing it if the holder has been gone longer than
    /// `timeout_ms`, otherwise waiting for release.
    pub async fn lock_steal_old(&self, name: &str, timeout_ms: u64) -> Result<()> {
        loop {
            if self.try_lock_steal_old(name, timeout_ms)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_MS)).await;
        }
    }

    /// Release `name`. Unlocking an absent lock is not an error.
    pub fn unlock(&self, name: &str) -> Result<()> {
        let path = self.lock_path(name);
        match std::fs::remove_dir(&path) {
            Ok(()) => {
                debug!("Released lock {name}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LockFailed {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    fn is_older_than(&self, name: &str, timeout_ms: u64) -> Result<bool> {
        let path = self.lock_path(name);
        match std::fs::metadata(&path) {
            Ok(meta) => {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .unwrap_or(Duration::ZERO);
                Ok(age > Duration::from_millis(timeout_ms))
            }
            // Holder released between our try_lock and here.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(Error::LockFailed {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    /// Base directory holding the lock directories.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn manager() -> (TempDir, FileSystemLockManager) {
        let dir = TempDir::new().unwrap();
        let mgr = FileSystemLockManager::new(dir.path());
        (dir, mgr)
    }

    fn age_lock(mgr: &FileSystemLockManager, name: &str, age: Duration) {
        let past = SystemTime::now() - age;
        let times = std::fs::File::open(mgr.lock_path(name)).unwrap();
        times.set_modified(past).unwrap();
    }

    #[test]
    fn test_try_lock_and_unlock() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("cleanup").unwrap());
        assert!(!mgr.try_lock("cleanup").unwrap());
        mgr.unlock("cleanup").unwrap();
        assert!(mgr.try_lock("cleanup").unwrap());
    }

    #[test]
    fn test_unlock_absent_is_ok() {
        let (_dir, mgr) = manager();
        mgr.unlock("never_taken").unwrap();
    }

    #[test]
    fn test_distinct_names_are_independent() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("a").unwrap());
        assert!(mgr.try_lock("b").unwrap());
    }

    #[test]
    fn test_steal_old_reclaims_stale_lock() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("stale").unwrap());
        age_lock(&mgr, "stale", Duration::from_secs(60));
        assert!(mgr.try_lock_steal_old("stale", 30_000).unwrap());
    }

    #[test]
    fn test_steal_old_respects_fresh_lock() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("fresh").unwrap());
        assert!(!mgr.try_lock_steal_old("fresh", 30_000).unwrap());
    }

    #[test]
    fn test_steal_resets_mtime() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("relock").unwrap());
        age_lock(&mgr, "relock", Duration::from_secs(60));
        assert!(mgr.try_lock_steal_old("relock", 30_000).unwrap());
        // Freshly stolen; a second stealer must now wait out the timeout.
        assert!(!mgr.try_lock_steal_old("relock", 30_000).unwrap());
    }

    #[tokio::test]
    async fn test_lock_timed_wait_times_out() {
        let (_dir, mgr) = manager();
        assert!(mgr.try_lock("busy").unwrap());
        assert!(!mgr.lock_timed_wait("busy", 150).await.unwrap());
        mgr.unlock("busy").unwrap();
        assert!(mgr.lock_timed_wait("busy", 150).await.unwrap());
    }
}
