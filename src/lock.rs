//! The Node Lock: an exclusive, process-wide advisory file lock held for the
//! lifetime of one coordinator command.
//!
//! Backed by `fs2`'s advisory file locking (the teacher crate has no direct
//! analogue for cross-process exclusion, so this is grounded directly in
//! the original `mcvirt.py:obtainLock`/`releaseLock` pair: create the lock
//! file and its directory if absent, attempt a non-blocking exclusive lock
//! with a short timeout, and fail with `AlreadyRunning` if another holder
//! exists). Acquisition is re-entrant-unsafe by design: a handle that
//! already holds the lock rejects a second `acquire` identically to a
//! foreign holder, matching the distilled spec's "no re-entrant counting".

use crate::error::{McVirtError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2000;

/// A held advisory lock. Dropping it releases the underlying file lock,
/// providing scoped acquisition with guaranteed release on every exit path
/// (including panics unwound through `?`), since this is a systems
/// implementation with no finaliser to depend on.
pub struct NodeLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release node lock");
        } else {
            debug!(path = %self.path.display(), "released node lock");
        }
    }
}

/// Handle to the lock file path; does not itself hold the lock. Call
/// `acquire` to obtain a `NodeLockGuard`, which is held for the duration of
/// one coordinator command and released on drop.
#[derive(Debug, Clone)]
pub struct NodeLock {
    path: PathBuf,
}

impl NodeLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        NodeLock { path: path.into() }
    }

    /// Ensures the lock file (and its parent directory) exist.
    fn ensure_file(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?)
    }

    /// Attempts to acquire the lock, retrying the non-blocking exclusive
    /// lock call until `timeout` elapses. Fails immediately (does not wait
    /// out the full timeout on the first definitive failure kind) with
    /// `AlreadyRunning` if another holder is still present once the
    /// timeout expires.
    pub fn acquire(&self, timeout: Duration) -> Result<NodeLockGuard> {
        let file = self.ensure_file()?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %self.path.display(), "acquired node lock");
                    return Ok(NodeLockGuard {
                        file,
                        path: self.path.clone(),
                    });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(_) => {
                    return Err(McVirtError::AlreadyRunning);
                }
            }
        }
    }

    pub fn acquire_default(&self) -> Result<NodeLockGuard> {
        self.acquire(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS))
    }

    /// Whether the lock currently appears to be held by anyone (best
    /// effort, racy by nature of advisory locks — used only for
    /// `checkStatus` reporting, never as a substitute for `acquire`).
    pub fn is_locked(&self) -> bool {
        let Ok(file) = self.ensure_file() else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = fs2::FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Releases a set of already-acquired guards in reverse order, matching the
/// ordering rule used on every acquire-failure path: locks are always torn
/// down in the reverse of the order they were taken.
pub fn release_in_reverse(mut guards: Vec<NodeLockGuard>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_round_trip() {
        let dir = tempdir().unwrap();
        let lock = NodeLock::new(dir.path().join("lock"));
        assert!(!lock.is_locked());
        let guard = lock.acquire_default().unwrap();
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn second_acquire_fails_with_already_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let lock_a = NodeLock::new(&path);
        let lock_b = NodeLock::new(&path);
        let _held = lock_a.acquire_default().unwrap();
        let err = lock_b.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, McVirtError::AlreadyRunning));
    }

    #[test]
    fn lock_file_created_if_missing() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("lock");
        let lock = NodeLock::new(&nested);
        let _guard = lock.acquire_default().unwrap();
        assert!(nested.exists());
    }
}
