//! # snapvault - scheduled incremental backups
//!
//! Weekly-full / daily-differential filesystem backups: archives a source
//! tree with GNU-tar-style snapshot markers, encrypts the artifact at rest,
//! and pushes it to a single remote host over a resumable sync transport.
//!
//! ## Pipeline
//!
//! One run is strictly sequential, with fail-fast error propagation:
//!
//! ```text
//! BackupOrchestrator -> ArchiveBuilder -> Encryptor -> Transporter
//! ```
//!
//! The mode of a run is a pure function of the calendar day: on the
//! configured full-backup weekday (default Sunday) the run (re)establishes a
//! full baseline and its snapshot marker; on every other day it produces a
//! differential archive containing changes since the last *full* backup —
//! each differential marker is forked from the full marker, never chained
//! off the previous differential.
//!
//! ## Artifacts
//!
//! ```text
//! backup-full-<machine>-<timestamp>.tar.gz[.gpg]   full archive
//! backup-full-<machine>.snar                       full snapshot marker
//! backup-diff-<machine>-<timestamp>.tar.gz[.gpg]   differential archive
//! backup-diff-<machine>-<index>.snar               differential marker
//! ```
//!
//! Markers are local-only state and never leave the machine. After a
//! successful run exactly one encrypted artifact exists locally for the
//! run's (mode, machine, timestamp) and the plaintext is gone.
//!
//! ## Safety on failure
//!
//! Every stage failure is terminal for the run and leaves the filesystem in
//! a safe state: either no artifact for this run, or one complete plaintext
//! or complete ciphertext — never a truncated file mistaken for complete.
//! The next scheduled invocation is the retry mechanism; it recovers any
//! debris a killed run left behind before starting.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapvault::{
//!     BackupOrchestrator, Configuration, RunContext, SystemRunner,
//! };
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Configuration::load(Path::new("/etc/snapvault/config.toml"))?;
//! let ctx = RunContext::new(
//!     &config,
//!     vec![PathBuf::from("/home")],
//!     vec![PathBuf::from("/home/nobody/.cache")],
//!     chrono::Local::now(),
//! )?;
//! let orchestrator = BackupOrchestrator::new(config, Arc::new(SystemRunner));
//! let report = orchestrator.run(&ctx)?;
//! println!("backed up {} bytes", report.bytes);
//! # Ok(())
//! # }
//! ```

// Public API modules
pub mod archive;
pub mod command;
pub mod config;
pub mod context;
pub mod encrypt;
pub mod error;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod snapshot;
pub mod transfer;
pub mod wizard;

// Re-export main types for convenience
pub use archive::{Archive, ArchiveBuilder};
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::{Configuration, DEFAULT_CONFIG_PATH};
pub use context::{select_mode, BackupMode, RunContext};
pub use encrypt::{EncryptedArchive, Encryptor};
pub use error::{BackupError, Result};
pub use lock::RunLock;
pub use orchestrator::{BackupOrchestrator, RunReport, RunState, Stage, StageFailure};
pub use snapshot::SnapshotStore;
pub use transfer::{SshOptions, Transporter};
