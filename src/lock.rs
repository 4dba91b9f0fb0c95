//! Per-machine single-run advisory lock
//!
//! The differential index counter and marker forking are shared mutable
//! filesystem state with no synchronization of their own, so at most one
//! run per machine may be in flight. Ownership is an exclusive `flock` held
//! on the lock file's descriptor for the lifetime of the run; the file body
//! records the owner's PID for diagnostics only and is never trusted for
//! liveness. A run killed mid-flight releases the kernel lock with its
//! descriptor, so the next invocation acquires without any stale-lock
//! bookkeeping: cleanup-and-retry, never resume.

use crate::error::{BackupError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held for the duration of one run; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    // released with the descriptor when the lock is dropped
    _guard: Flock<File>,
}

impl RunLock {
    /// Acquire the lock for `machine` under `root`
    ///
    /// # Errors
    ///
    /// [`BackupError::LockHeld`] when another process holds the lock.
    pub fn acquire(root: &Path, machine: &str) -> Result<Self> {
        let path = root.join(format!(".snapvault-{}.lock", machine));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut guard) => {
                guard.set_len(0)?;
                guard.write_all(std::process::id().to_string().as_bytes())?;
                debug!("Acquired run lock {:?}", path);
                Ok(RunLock { path, _guard: guard })
            }
            Err((mut file, errno)) => {
                // the holder's PID is best-effort diagnostics; an empty or
                // garbled body still means the kernel lock is held
                let mut contents = String::new();
                let _ = file.read_to_string(&mut contents);
                let pid = contents.trim().parse::<i32>().unwrap_or(0);
                warn!(
                    "Run lock {:?} is held (pid {}, flock: {})",
                    path, pid, errno
                );
                Err(BackupError::LockHeld {
                    machine: machine.to_string(),
                    path,
                    pid,
                })
            }
        }
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove run lock file {:?}: {}", self.path, e);
        } else {
            info!("Released run lock {:?}", self.path);
        }
    }
}
