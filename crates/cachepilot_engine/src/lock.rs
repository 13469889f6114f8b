//! Single-instance run locking.
//!
//! Two concurrent runs would interleave writes to the timestamp store and
//! the exclusion list, so one advisory lock covers the whole run. flock
//! semantics release the lock when the process dies, which makes stale
//! locks impossible; a JSON sidecar records who holds it so a refused run
//! can say which process is in the way.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75
//! compatible; std::fs::File::lock() requires Rust 1.89+).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another run is already active{}", holder_suffix(.holder))]
    Locked {
        path: PathBuf,
        holder: Option<LockSidecar>,
    },

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

fn holder_suffix(holder: &Option<LockSidecar>) -> String {
    match holder {
        Some(sidecar) => format!(" (pid {}, started {})", sidecar.pid, sidecar.timestamp),
        None => String::new(),
    }
}

/// Identifies the process holding the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSidecar {
    pub pid: u32,
    pub exe: Option<String>,
    pub timestamp: String,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let ext = lock_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("lock");
    lock_path.with_extension(format!("{ext}.json"))
}

fn write_lock_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!(
                "Failed to write lock sidecar {}: {}",
                sidecar_path.display(),
                e
            );
            None
        }
    }
}

fn read_lock_sidecar(lock_path: &Path) -> Option<LockSidecar> {
    let raw = fs::read_to_string(sidecar_path_for(lock_path)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// A guard holding the exclusive run lock.
///
/// The lock is released when the guard is dropped.
pub struct RunLockGuard {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl RunLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        debug!("Releasing run lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
        // File is automatically unlocked when closed (fs2 uses flock/LockFileEx)
    }
}

impl std::fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Try to acquire the run lock, without blocking.
///
/// If another run holds it, returns `LockError::Locked` immediately with
/// whatever the sidecar says about the holder.
pub fn try_lock_run(lock_path: &Path) -> Result<RunLockGuard, LockError> {
    debug!("Attempting to acquire run lock: {}", lock_path.display());

    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(LockError::CreateFailed)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(LockError::CreateFailed)?;

    // Fully qualified so this keeps calling fs2's method rather than
    // std::fs::File::try_lock_exclusive from Rust 1.89+.
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("Acquired run lock: {}", lock_path.display());
            let sidecar_path = write_lock_sidecar(lock_path);
            Ok(RunLockGuard {
                _file: file,
                lock_path: lock_path.to_path_buf(),
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let holder = read_lock_sidecar(lock_path);
            debug!("Run lock is held by another process");
            Err(LockError::Locked {
                path: lock_path.to_path_buf(),
                holder,
            })
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_and_release() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");

        let guard = try_lock_run(&lock_path).unwrap();
        assert!(guard.lock_path().exists());
        drop(guard);

        // Released locks can be reacquired.
        let _guard2 = try_lock_run(&lock_path).unwrap();
    }

    #[test]
    fn test_lock_contention_reports_holder() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");

        let _guard = try_lock_run(&lock_path).unwrap();

        // flock treats a second descriptor as a separate holder even within
        // one process, so this conflicts.
        match try_lock_run(&lock_path) {
            Err(LockError::Locked { holder, .. }) => {
                assert_eq!(holder.unwrap().pid, std::process::id());
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_sidecar_lifecycle() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");
        let sidecar = sidecar_path_for(&lock_path);

        let guard = try_lock_run(&lock_path).unwrap();
        assert!(sidecar.exists());

        let parsed = read_lock_sidecar(&lock_path).unwrap();
        assert_eq!(parsed.pid, std::process::id());

        drop(guard);
        assert!(!sidecar.exists());
    }

    #[test]
    fn test_sidecar_path_naming() {
        assert_eq!(
            sidecar_path_for(Path::new("/var/lib/run.lock")),
            PathBuf::from("/var/lib/run.lock.json")
        );
    }
}
