//! Per-run context and backup mode selection
//!
//! A [`RunContext`] is constructed once at the start of a run and read-only
//! afterwards; every component receives it by reference instead of reading
//! ambient process state. It also owns the artifact naming scheme, which is
//! bit-exact for downstream tooling:
//!
//! ```text
//! backup-full-<machine>-<timestamp>.tar.gz   full archive
//! backup-full-<machine>.snar                 full snapshot marker
//! backup-diff-<machine>-<timestamp>.tar.gz   differential archive
//! backup-diff-<machine>-<index>.snar         differential snapshot marker
//! ```

use crate::config::{reject_unsafe, Configuration};
use crate::error::{BackupError, Result};
use chrono::{DateTime, Datelike, Local};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Timestamp format embedded in archive file names
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Suffix of snapshot marker files
pub const MARKER_SUFFIX: &str = ".snar";

/// Suffix appended to an archive by the encryption stage
pub const CIPHERTEXT_SUFFIX: &str = ".gpg";

/// Backup mode for a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Complete archive of the source tree, establishing a new baseline
    Full,
    /// Changes since the last full backup (not since the last differential)
    Differential,
}

impl BackupMode {
    /// Tag used in artifact names
    pub fn tag(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Differential => "diff",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::Differential => write!(f, "differential"),
        }
    }
}

/// Select the backup mode for a calendar day
///
/// A pure function of the ISO weekday (1 = Monday .. 7 = Sunday) and the
/// configured full-backup day; deterministic and idempotent per day,
/// independent of time-of-day.
pub fn select_mode(weekday: u32, full_day: u32) -> BackupMode {
    if weekday == full_day {
        BackupMode::Full
    } else {
        BackupMode::Differential
    }
}

/// Immutable state for one backup invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Source paths to archive
    pub sources: Vec<PathBuf>,
    /// Paths excluded from the archive
    pub exclusions: Vec<PathBuf>,
    /// Resolved backup mode for this run
    pub mode: BackupMode,
    /// Timestamp string baked into artifact names
    pub timestamp: String,
    /// Machine identity the snapshot lineage is keyed by
    pub machine: String,
}

impl RunContext {
    /// Build the context for one run
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidInput`] if no source was given or a
    ///   user-supplied path contains unsafe characters
    pub fn new(
        config: &Configuration,
        sources: Vec<PathBuf>,
        exclusions: Vec<PathBuf>,
        now: DateTime<Local>,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(BackupError::invalid_input(
                "source",
                "at least one --source path is required",
            ));
        }
        for source in &sources {
            reject_unsafe("source", &source.to_string_lossy())?;
        }
        for exclusion in &exclusions {
            reject_unsafe("exclude-this", &exclusion.to_string_lossy())?;
        }

        let machine = machine_identity()?;
        let weekday = now.weekday().number_from_monday();
        let mode = select_mode(weekday, config.full_backup_weekday);
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        debug!(
            "Run context: machine={} weekday={} mode={} timestamp={}",
            machine, weekday, mode, timestamp
        );

        Ok(RunContext {
            sources,
            exclusions,
            mode,
            timestamp,
            machine,
        })
    }

    /// File name of the archive this run produces
    pub fn archive_file_name(&self) -> String {
        format!(
            "backup-{}-{}-{}.tar.gz",
            self.mode.tag(),
            self.machine,
            self.timestamp
        )
    }
}

/// File name of the full snapshot marker for a machine
pub fn full_marker_name(machine: &str) -> String {
    format!("backup-full-{}{}", machine, MARKER_SUFFIX)
}

/// File name of a differential snapshot marker for a machine
pub fn differential_marker_name(machine: &str, index: u32) -> String {
    format!("backup-diff-{}-{}{}", machine, index, MARKER_SUFFIX)
}

/// Resolve the local machine identity used to key the snapshot lineage
pub fn machine_identity() -> Result<String> {
    let name = hostname::get()
        .map_err(BackupError::Io)?
        .to_string_lossy()
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(BackupError::invalid_input(
            "hostname",
            "machine reported an empty hostname",
        ));
    }
    reject_unsafe("hostname", &name)?;
    Ok(name)
}
