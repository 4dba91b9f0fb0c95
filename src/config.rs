//! Configuration loading and validation
//!
//! The configuration lives in a single TOML file (default
//! `/etc/snapvault/config.toml`), is loaded once at process start, and is
//! immutable for the rest of the run. A missing file is a fatal
//! precondition ([`BackupError::ConfigMissing`]).
//!
//! Fields that end up on a remote shell command line (`remote_user`,
//! `remote_host`, `remote_root`) are validated against shell metacharacters
//! at load time and rejected with [`BackupError::InvalidInput`] before any
//! stage runs.

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapvault/config.toml";

/// Characters that are never allowed in fields interpreted by a shell
///
/// Local arguments are passed as exec-style argv and need no quoting, but
/// the rsync remote path is a word on the remote login shell's command
/// line, so metacharacters there would execute on the backup target.
const UNSAFE_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\'', '"', '\\', '*', '?', '!', '\n',
    '\r', '\t', ' ',
];

/// Immutable per-process configuration
///
/// Loaded from TOML once at startup; every component receives it by
/// reference and no component reads ambient process state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Login user on the remote backup host
    pub remote_user: String,
    /// Remote backup host
    pub remote_host: String,
    /// SSH port on the remote host
    #[serde(default = "default_port")]
    pub remote_port: u16,
    /// Path to the SSH private key used for the transfer
    pub identity_file: PathBuf,
    /// Symmetric passphrase for archive encryption
    pub passphrase: String,
    /// Local directory that receives archives and snapshot markers
    pub local_root: PathBuf,
    /// Directory on the remote host that receives encrypted archives
    pub remote_root: String,
    /// Transfer bandwidth cap in KB/s
    #[serde(default = "default_bandwidth")]
    pub bandwidth_limit_kb: u32,
    /// ISO weekday (1 = Monday .. 7 = Sunday) on which a full backup runs
    #[serde(default = "default_full_weekday")]
    pub full_backup_weekday: u32,
    /// Remove the local encrypted artifact after a successful transfer
    #[serde(default)]
    pub delete_after_transfer: bool,
}

fn default_port() -> u16 {
    22
}

fn default_bandwidth() -> u32 {
    4096
}

fn default_full_weekday() -> u32 {
    7
}

impl Configuration {
    /// Load and validate the configuration from `path`
    ///
    /// # Errors
    ///
    /// - [`BackupError::ConfigMissing`] if the file does not exist
    /// - [`BackupError::ConfigParse`] if the TOML is malformed
    /// - [`BackupError::InvalidInput`] if a field fails validation
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BackupError::ConfigMissing(path.to_path_buf()));
        }
        debug!("Loading configuration from {:?}", path);
        let raw = fs::read_to_string(path)?;
        let config: Configuration = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all user-supplied fields
    pub fn validate(&self) -> Result<()> {
        reject_unsafe("remote_user", &self.remote_user)?;
        reject_unsafe("remote_host", &self.remote_host)?;
        reject_unsafe("remote_root", &self.remote_root)?;
        // the identity path is embedded in rsync's remote-shell string,
        // which the tool word-splits
        reject_unsafe("identity_file", &self.identity_file.to_string_lossy())?;
        if self.remote_user.is_empty() {
            return Err(BackupError::invalid_input("remote_user", "must not be empty"));
        }
        if self.remote_host.is_empty() {
            return Err(BackupError::invalid_input("remote_host", "must not be empty"));
        }
        if self.remote_root.is_empty() {
            return Err(BackupError::invalid_input("remote_root", "must not be empty"));
        }
        if !(1..=7).contains(&self.full_backup_weekday) {
            return Err(BackupError::invalid_input(
                "full_backup_weekday",
                "must be an ISO weekday between 1 and 7",
            ));
        }
        Ok(())
    }

    /// Persist the configuration to `path`, creating parent directories
    ///
    /// The file is written to a temporary sibling and renamed into place so
    /// a crash cannot leave a truncated config, and restricted to mode 600
    /// because it contains the passphrase.
    pub fn persist(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let parent = path.parent().ok_or_else(|| {
            BackupError::invalid_input("config path", "has no parent directory")
        })?;
        fs::create_dir_all(parent)?;

        let rendered = toml::to_string_pretty(self)
            .map_err(|e| BackupError::invalid_input("configuration", e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(path).map_err(|e| BackupError::Io(e.error))?;
        info!("Configuration written to {:?}", path);
        Ok(())
    }

    /// Remote target in rsync `user@host:path/` form
    pub fn rsync_target(&self) -> String {
        let mut root = self.remote_root.clone();
        if !root.ends_with('/') {
            root.push('/');
        }
        format!("{}@{}:{}", self.remote_user, self.remote_host, root)
    }
}

/// Reject values containing shell metacharacters
pub fn reject_unsafe(field: &str, value: &str) -> Result<()> {
    if let Some(c) = value.chars().find(|c| UNSAFE_CHARS.contains(c) || c.is_control()) {
        return Err(BackupError::invalid_input(
            field,
            format!("contains forbidden character {:?}", c),
        ));
    }
    Ok(())
}
