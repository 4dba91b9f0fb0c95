//! Archive construction via the external archiving tool
//!
//! [`ArchiveBuilder`] produces exactly one artifact per run by invoking
//! `tar --create --gzip --listed-incremental=<marker>`:
//!
//! - **full**: the full marker is removed first so the same tar pass that
//!   scans the source tree re-initializes it — the marker then reflects
//!   exactly the state captured in this archive;
//! - **differential**: the next index is obtained, the full marker is forked,
//!   and tar archives changes against the forked copy.
//!
//! Any non-zero tool exit fails the build; a partial archive is removed so a
//! stale artifact can never be picked up downstream.

use crate::command::{CommandRunner, CommandSpec};
use crate::context::{BackupMode, RunContext};
use crate::error::{BackupError, Result};
use crate::snapshot::SnapshotStore;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Handle to the one artifact produced by a run
///
/// Threaded explicitly into the encryption stage; the archive to encrypt is
/// never re-discovered by filename pattern matching.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Plaintext artifact path
    pub path: PathBuf,
    /// Mode the artifact was built in
    pub mode: BackupMode,
    /// Snapshot marker written alongside the artifact (local-only state)
    pub marker: PathBuf,
}

/// Builds full and differential archives for a run
pub struct ArchiveBuilder {
    runner: Arc<dyn CommandRunner>,
    store: SnapshotStore,
}

impl ArchiveBuilder {
    /// Create a builder over the given store
    pub fn new(runner: Arc<dyn CommandRunner>, store: SnapshotStore) -> Self {
        ArchiveBuilder { runner, store }
    }

    /// Build the archive the context's mode calls for
    pub fn build(&self, ctx: &RunContext) -> Result<Archive> {
        match ctx.mode {
            BackupMode::Full => self.build_full(ctx),
            BackupMode::Differential => self.build_differential(ctx),
        }
    }

    /// Build a full archive, re-initializing the full snapshot marker
    #[instrument(skip(self, ctx), fields(machine = %ctx.machine))]
    pub fn build_full(&self, ctx: &RunContext) -> Result<Archive> {
        // tar treats an existing marker as a baseline and would produce an
        // incremental archive; remove it so this pass starts at level 0
        self.store.reset_full_marker(&ctx.machine)?;
        let marker = self.store.full_marker_path(&ctx.machine);
        let archive = self.store.root().join(ctx.archive_file_name());

        info!("Building full archive {:?}", archive);
        if let Err(e) = self.run_tar(ctx, &archive, &marker) {
            // a half-initialized full marker would poison every later
            // differential, so it goes along with the partial archive
            remove_if_present(&archive);
            remove_if_present(&marker);
            return Err(e);
        }

        Ok(Archive {
            path: archive,
            mode: BackupMode::Full,
            marker,
        })
    }

    /// Build a differential archive against a forked full marker
    ///
    /// Requires a completed full backup; validation is delegated to
    /// [`SnapshotStore::fork_differential`].
    #[instrument(skip(self, ctx), fields(machine = %ctx.machine))]
    pub fn build_differential(&self, ctx: &RunContext) -> Result<Archive> {
        let index = self.store.next_differential_index(&ctx.machine)?;
        let marker = self.store.fork_differential(&ctx.machine, index)?;
        let archive = self.store.root().join(ctx.archive_file_name());

        info!(
            "Building differential archive {:?} (index {})",
            archive, index
        );
        if let Err(e) = self.run_tar(ctx, &archive, &marker) {
            // the forked marker stays: markers are never deleted
            // automatically, and a retry takes the next index
            remove_if_present(&archive);
            return Err(e);
        }

        Ok(Archive {
            path: archive,
            mode: BackupMode::Differential,
            marker,
        })
    }

    fn run_tar(&self, ctx: &RunContext, archive: &PathBuf, marker: &PathBuf) -> Result<()> {
        let mut spec = CommandSpec::new("tar")
            .arg("--create")
            .arg("--gzip")
            .arg(format!("--listed-incremental={}", marker.display()))
            .arg("--file")
            .arg(archive);
        for exclusion in &ctx.exclusions {
            spec = spec.arg(format!("--exclude={}", exclusion.display()));
        }
        for source in &ctx.sources {
            spec = spec.arg(source.as_os_str());
        }

        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(BackupError::build(format!(
                "tar exited with status {:?}: {}",
                output.status,
                output.stderr_text()
            )));
        }
        Ok(())
    }
}

fn remove_if_present(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove partial artifact {:?}: {}", path, e);
        }
    }
}
