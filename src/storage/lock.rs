//! Single-instance lock for the journal root.
//!
//! Exactly one process may own the journal (and therefore one open session)
//! at a time. The lock is an advisory `fs2` lock on `<root>/idswap.lock`
//! that also records who holds it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IdError, Result};

/// Advisory file lock held for the lifetime of an orchestrator.
#[derive(Debug)]
pub struct InstanceLock {
    lock_file: File,
    lock_path: PathBuf,
}

impl InstanceLock {
    const LOCK_FILENAME: &'static str = "idswap.lock";

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `LockFailed` naming the current holder when another process
    /// (or another handle in this process) owns it.
    pub fn acquire(root: &Path) -> Result<Self> {
        let lock_path = root.join(Self::LOCK_FILENAME);
        fs::create_dir_all(root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| IdError::LockFailed(format!("open lock file: {e}")))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = Self::holder(root)
                    .map(|h| format!("pid {} on {} since {}", h.pid, h.hostname, h.acquired_at))
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(IdError::LockFailed(format!(
                    "{} is held by {holder}",
                    lock_path.display()
                )));
            }
            Err(e) => return Err(IdError::LockFailed(format!("acquire lock: {e}"))),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        if let Ok(holder_json) = serde_json::to_string(&holder) {
            if let Err(err) = fs::write(&lock_path, holder_json) {
                warn!(path = %lock_path.display(), error = %err, "could not record lock holder");
            }
        }

        debug!(path = %lock_path.display(), "acquired instance lock");
        Ok(Self {
            lock_file,
            lock_path,
        })
    }

    /// Read the recorded holder, if any.
    #[must_use]
    pub fn holder(root: &Path) -> Option<LockHolder> {
        let content = fs::read_to_string(root.join(Self::LOCK_FILENAME)).ok()?;
        serde_json::from_str(&content).ok()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            debug!("Failed to release lock: {}", e);
        }
        debug!("Released instance lock");
    }
}

/// Information about the current lock holder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_records_holder() {
        let dir = tempdir().unwrap();
        let lock = InstanceLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());

        let holder = InstanceLock::holder(dir.path()).unwrap();
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _lock = InstanceLock::acquire(dir.path()).unwrap();

        let err = InstanceLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, IdError::LockFailed(_)));
        assert!(err.to_string().contains("pid"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _lock = InstanceLock::acquire(dir.path()).unwrap();
        }
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }
}
