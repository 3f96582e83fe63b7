//! Cross-process mutual exclusion per physical device.
//!
//! The vendor hardware APIs are not safe for concurrent invocation from
//! multiple processes, and workers for different channels of one controller
//! may live in different processes. An in-process mutex is therefore not
//! enough: the exclusion scope is an OS-level advisory lock on a file keyed
//! by the device, held for the full connect→operate→disconnect sequence.

use crate::error::{CyclerError, CyclerResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Advisory lock keyed by a device's lock-file path.
#[derive(Debug, Clone)]
pub struct DeviceLock {
    path: PathBuf,
}

impl DeviceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the device is exclusively ours.
    ///
    /// The blocking `flock` runs on the blocking pool so executor threads
    /// stay free. The returned guard releases the lock on every exit path,
    /// including retry-loop exits, via `Drop`.
    pub async fn acquire(&self) -> CyclerResult<LockGuard> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> CyclerResult<File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| CyclerError::Driver(format!("lock task failed: {e}")))??;
        debug!(path = %self.path.display(), "device lock acquired");
        Ok(LockGuard {
            file,
            path: self.path.clone(),
        })
    }
}

/// Holds the advisory lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            // The OS releases the lock when the descriptor closes anyway.
            warn!(path = %self.path.display(), error = %err, "explicit unlock failed");
        } else {
            debug!(path = %self.path.display(), "device lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt;

    #[tokio::test]
    async fn acquire_creates_lock_file_and_releases_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("cycler-1.lock");
        let lock = DeviceLock::new(&lock_path);

        let guard = lock.acquire().await.expect("first acquire");
        assert!(lock_path.exists());

        // A second handle must not get the exclusive lock while held.
        let probe = File::open(&lock_path).expect("open probe");
        assert!(probe.try_lock_exclusive().is_err());

        drop(guard);
        probe.try_lock_exclusive().expect("lock free after drop");
    }

    #[tokio::test]
    async fn reacquire_after_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = DeviceLock::new(dir.path().join("dev.lock"));
        drop(lock.acquire().await.expect("first"));
        drop(lock.acquire().await.expect("second"));
    }
}
