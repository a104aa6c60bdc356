//! Sidecar lock file guarding the JSON document store.
//!
//! The lock is an exclusively-created marker file next to the document.
//! Acquisition polls `create_new` until it succeeds or the timeout elapses;
//! the guard deletes the marker on drop, so release happens on every exit
//! path, including errors.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::StoreError;

/// Exclusive lock held for the lifetime of the guard.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, polling every `poll_interval` until `timeout`.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let start = Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    // Holder pid and time, for diagnosing abandoned locks.
                    let _ = write!(
                        file,
                        "{} {}",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    debug!(path = %path.display(), "Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(StoreError::LockTimeout {
                            path: path.display().to_string(),
                            waited: start.elapsed(),
                        });
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove lock file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json.lock");

        let guard = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(path.exists());

        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn held_lock_times_out_second_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json.lock");

        let _guard = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();

        let err = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn lock_reacquirable_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json.lock");

        let guard = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        drop(guard);

        let again = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(5))
            .await;
        assert!(again.is_ok());
    }
}
