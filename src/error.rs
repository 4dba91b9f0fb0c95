//! Error types for the snapvault library
//!
//! Every stage of a backup run reports failures through [`BackupError`].
//! Errors carry the full internal diagnostic (tool stderr, paths) so the log
//! can record exactly what happened, while [`BackupError::operator_message`]
//! produces the generic line shown on the interactive output — internal
//! command output, paths, and secrets never appear there.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapvault library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all snapvault operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// Configuration file is absent — a fatal precondition
    #[error("configuration not found at {0:?} - run with --configure-me first")]
    ConfigMissing(PathBuf),

    /// Missing privilege to perform a backup run
    #[error("insufficient privilege: {0}")]
    Privilege(String),

    /// User-supplied field rejected due to unsafe content
    #[error("invalid input in {field}: {reason}")]
    InvalidInput {
        /// Which configuration or CLI field was rejected
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// A differential run was attempted before any full backup exists
    ///
    /// Kept distinct from [`BackupError::Store`] and plain I/O errors so the
    /// first-run-must-be-full rule can be validated explicitly.
    #[error("no full snapshot marker for machine '{machine}' - a full backup must complete before a differential run")]
    MissingFullMarker {
        /// Machine whose marker is missing
        machine: String,
    },

    /// Snapshot marker store errors (corrupt or unreadable markers)
    #[error("snapshot store error: {0}")]
    Store(String),

    /// Archiving tool failure, with the underlying diagnostic
    #[error("archive build failed: {0}")]
    Build(String),

    /// Encryption refused or failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Transfer tool failure, with the underlying diagnostic
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Another run holds the per-machine lock
    #[error("another backup run for machine '{machine}' holds the lock at {path:?} (pid {pid})")]
    LockHeld {
        /// Machine identity the lock is keyed by
        machine: String,
        /// Lock file path
        path: PathBuf,
        /// PID recorded in the lock file, 0 when unreadable
        pid: i32,
    },

    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Walk directory error from walkdir crate
    #[error("walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Configuration file parse failure
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl BackupError {
    /// Create a store error with a custom message
    pub fn store(msg: impl Into<String>) -> Self {
        BackupError::Store(msg.into())
    }

    /// Create a build error with a custom message
    pub fn build(msg: impl Into<String>) -> Self {
        BackupError::Build(msg.into())
    }

    /// Create an encryption error with a custom message
    pub fn encryption(msg: impl Into<String>) -> Self {
        BackupError::Encryption(msg.into())
    }

    /// Create a transfer error with a custom message
    pub fn transfer(msg: impl Into<String>) -> Self {
        BackupError::Transfer(msg.into())
    }

    /// Create an invalid-input error for a named field
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BackupError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a precondition failure (nothing ran yet)
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackupError::ConfigMissing(_)
                | BackupError::Privilege(_)
                | BackupError::InvalidInput { .. }
                | BackupError::LockHeld { .. }
        )
    }

    /// Generic message for the interactive output
    ///
    /// Deliberately free of tool output, paths, and anything derived from
    /// the configuration; the log holds the real diagnostic.
    pub fn operator_message(&self) -> &'static str {
        match self {
            BackupError::ConfigMissing(_) => {
                "no configuration found; run with --configure-me to create one"
            }
            BackupError::Privilege(_) => "this program must be run with elevated privileges",
            BackupError::InvalidInput { .. } => "a configuration or argument field was rejected",
            BackupError::MissingFullMarker { .. } => {
                "no full backup exists yet for this machine; a full run must complete first"
            }
            BackupError::Store(_) => "the snapshot marker store is in an unexpected state",
            BackupError::Build(_) => "the archiving stage failed",
            BackupError::Encryption(_) => "the encryption stage failed",
            BackupError::Transfer(_) => "the transfer stage failed",
            BackupError::LockHeld { .. } => "another backup run is already in progress",
            BackupError::Io(_) | BackupError::WalkDir(_) => "a filesystem operation failed",
            BackupError::ConfigParse(_) => "the configuration file could not be parsed",
        }
    }
}
