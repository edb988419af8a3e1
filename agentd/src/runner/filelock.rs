//! Producer file lock.
//!
//! An OS-level exclusive lock on a path under /tmp keeps concurrent
//! producers from double-enqueueing. Acquisition is non-blocking; a held
//! lock means another producer is active and this one backs off.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use fs2::FileExt;
use tracing::{debug, info};

/// Held for the duration of one producer pass; released on drop.
pub struct ProducerLock {
    file: File,
    path: PathBuf,
}

impl ProducerLock {
    /// Try to take the lock without blocking. Contention is an error the
    /// caller turns into a backed-off exit.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context(format!("Failed to open lock file {}", path.display()))?;

        file.try_lock_exclusive()
            .map_err(|_| eyre!("another producer holds the lock at {}", path.display()))?;

        info!(path = %path.display(), "producer lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for ProducerLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "producer lock release failed");
        }
    }
}
