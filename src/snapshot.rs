//! Snapshot marker store
//!
//! GNU-tar-style incremental backups hinge on opaque snapshot marker files
//! (`.snar`). This module persists and retrieves them per machine:
//!
//! - one full marker per machine, (re)created only by full runs;
//! - an ordered sequence of differential markers, each a byte-for-byte copy
//!   of the full marker at fork time (copy-then-update, never a chain of
//!   diffs), numbered from 1 and never deleted automatically.
//!
//! Markers are local-only state; the transfer stage never sees them.

use crate::context::{differential_marker_name, full_marker_name, MARKER_SUFFIX};
use crate::error::{BackupError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Persists and retrieves per-machine snapshot markers
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open a store rooted at the local backup directory
    ///
    /// Creates the root directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(SnapshotStore { root })
    }

    /// Root directory holding markers and archives
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the full snapshot marker for `machine`
    ///
    /// The file may not exist yet; the first full run creates it.
    pub fn full_marker_path(&self, machine: &str) -> PathBuf {
        self.root.join(full_marker_name(machine))
    }

    /// Path of the differential marker `index` for `machine`
    pub fn differential_marker_path(&self, machine: &str, index: u32) -> PathBuf {
        self.root.join(differential_marker_name(machine, index))
    }

    /// Whether a full backup has ever completed for `machine`
    pub fn has_full_marker(&self, machine: &str) -> bool {
        self.full_marker_path(machine).is_file()
    }

    /// Next differential index for `machine`
    ///
    /// Defined as the count of existing differential markers plus one.
    /// Race-free only under the single-run-at-a-time lock; see
    /// [`crate::lock::RunLock`].
    pub fn next_differential_index(&self, machine: &str) -> Result<u32> {
        let prefix = format!("backup-diff-{}-", machine);
        let mut count: u32 = 0;
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(middle) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(MARKER_SUFFIX))
            {
                // only numbered markers count; a stray file with the same
                // shape of name must not disturb the sequence
                if middle.parse::<u32>().is_ok() {
                    count += 1;
                }
            }
        }
        debug!(
            "Found {} differential markers for machine '{}'",
            count, machine
        );
        Ok(count + 1)
    }

    /// Fork the full marker into differential marker `index`
    ///
    /// A differential run is invalid before any full run has completed, so a
    /// missing full marker fails with [`BackupError::MissingFullMarker`]
    /// rather than a generic I/O error.
    pub fn fork_differential(&self, machine: &str, index: u32) -> Result<PathBuf> {
        let full = self.full_marker_path(machine);
        if !full.is_file() {
            return Err(BackupError::MissingFullMarker {
                machine: machine.to_string(),
            });
        }
        let fork = self.differential_marker_path(machine, index);
        fs::copy(&full, &fork).map_err(|e| {
            BackupError::store(format!(
                "failed to fork full marker {:?} to {:?}: {}",
                full, fork, e
            ))
        })?;
        info!("Forked full marker into {:?}", fork);
        Ok(fork)
    }

    /// Remove the full marker for `machine` if present
    ///
    /// Used before a full run so the archiving tool starts a level-0 scan
    /// instead of an incremental one against the old baseline.
    pub fn reset_full_marker(&self, machine: &str) -> Result<()> {
        let full = self.full_marker_path(machine);
        if full.is_file() {
            debug!("Removing stale full marker {:?}", full);
            fs::remove_file(&full)?;
        }
        Ok(())
    }
}
