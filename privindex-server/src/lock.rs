//! Timeout-bounded exclusive file locks.
//!
//! Uploads serialize on a lock file per (instance, filename). Acquisition
//! polls `try_lock_exclusive` and gives up after the caller's timeout, so a
//! stuck uploader can delay others by at most that long.

use crate::error::{AppError, AppResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Holds an exclusive lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

/// Acquire an exclusive lock on `path`, creating the file and its parent
/// directory when missing.
///
/// Fails with [`AppError::LockTimeout`] once `timeout` has elapsed.
pub async fn acquire_exclusive(path: &Path, timeout: Duration) -> AppResult<FileLockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    let lock_start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::trace!(path = %path.display(), attempts, "Lock acquired");
                return Ok(FileLockGuard {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(_) if lock_start.elapsed() < timeout => {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    attempts,
                    error = %e,
                    "Timeout waiting for exclusive lock"
                );
                return Err(AppError::LockTimeout(format!(
                    "Lock acquire timeout after {:.1}s: {}",
                    timeout.as_secs_f64(),
                    path.display()
                )));
            }
        }
    }
}
