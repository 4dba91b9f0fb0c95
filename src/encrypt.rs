//! Archive encryption at rest
//!
//! Encrypts one artifact symmetrically (AES-256 via `gpg --symmetric`),
//! replacing the plaintext file with its ciphertext sibling. The stage is
//! deliberately paranoid about its two end states: on success the plaintext
//! is gone and a complete ciphertext exists; on failure the plaintext is
//! retained and any partial ciphertext is removed. The run never continues
//! past a failed encryption.

use crate::archive::Archive;
use crate::command::{CommandRunner, CommandSpec};
use crate::context::{BackupMode, CIPHERTEXT_SUFFIX};
use crate::error::{BackupError, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// An encrypted artifact, ready for transfer
#[derive(Debug, Clone)]
pub struct EncryptedArchive {
    /// Ciphertext path (plaintext name + ciphertext suffix)
    pub path: PathBuf,
    /// Mode of the underlying archive
    pub mode: BackupMode,
}

/// Symmetric encryption stage
pub struct Encryptor {
    runner: Arc<dyn CommandRunner>,
}

impl Encryptor {
    /// Create an encryptor over the given runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Encryptor { runner }
    }

    /// Encrypt `archive`, consuming the plaintext on success
    ///
    /// # Errors
    ///
    /// [`BackupError::Encryption`] when the passphrase is empty, the archive
    /// is missing or zero-length (guarding against silently "encrypting"
    /// nothing), or the tool exits non-zero.
    #[instrument(skip(self, archive, passphrase), fields(archive = ?archive.path))]
    pub fn encrypt(&self, archive: Archive, passphrase: &str) -> Result<EncryptedArchive> {
        if passphrase.is_empty() {
            return Err(BackupError::encryption(
                "refusing to encrypt with an empty passphrase",
            ));
        }
        let len = fs::metadata(&archive.path)
            .map_err(|e| {
                BackupError::encryption(format!("archive {:?} is not readable: {}", archive.path, e))
            })?
            .len();
        if len == 0 {
            return Err(BackupError::encryption(format!(
                "archive {:?} is zero-length",
                archive.path
            )));
        }

        let mut ciphertext = archive.path.clone().into_os_string();
        ciphertext.push(CIPHERTEXT_SUFFIX);
        let ciphertext = PathBuf::from(ciphertext);

        let spec = CommandSpec::new("gpg")
            .arg("--batch")
            .arg("--yes")
            .arg("--pinentry-mode")
            .arg("loopback")
            .arg("--passphrase-fd")
            .arg("0")
            .arg("--symmetric")
            .arg("--cipher-algo")
            .arg("AES256")
            .arg("--output")
            .arg(&ciphertext)
            .arg(&archive.path)
            .stdin_bytes(format!("{}\n", passphrase).into_bytes());

        let output = self.runner.run(&spec)?;
        if !output.success() {
            remove_partial(&ciphertext);
            return Err(BackupError::encryption(format!(
                "gpg exited with status {:?}: {}",
                output.status,
                output.stderr_text()
            )));
        }

        // a zero-length or absent ciphertext after exit 0 means the tool
        // lied; keep the plaintext and treat the run as failed
        let ok = fs::metadata(&ciphertext).map(|m| m.len() > 0).unwrap_or(false);
        if !ok {
            remove_partial(&ciphertext);
            return Err(BackupError::encryption(format!(
                "gpg reported success but produced no ciphertext at {:?}",
                ciphertext
            )));
        }

        fs::remove_file(&archive.path)?;
        info!("Encrypted {:?} -> {:?}", archive.path, ciphertext);
        Ok(EncryptedArchive {
            path: ciphertext,
            mode: archive.mode,
        })
    }
}

fn remove_partial(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove partial ciphertext {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{FakeRunner, FakeResponse};
    use tempfile::TempDir;

    fn plaintext(dir: &std::path::Path) -> Archive {
        let path = dir.join("backup-full-host1-2024-06-02_01-02-03.tar.gz");
        fs::write(&path, b"tarball-bytes").unwrap();
        Archive {
            path,
            mode: BackupMode::Full,
            marker: dir.join("backup-full-host1.snar"),
        }
    }

    #[test]
    fn test_empty_passphrase_refused_before_tool_runs() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let archive = plaintext(tmp.path());

        let err = Encryptor::new(runner.clone())
            .encrypt(archive, "")
            .unwrap_err();
        assert!(matches!(err, BackupError::Encryption(_)));
        assert_eq!(runner.invocation_count(), 0);
    }

    #[test]
    fn test_missing_archive_refused() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let archive = Archive {
            path: tmp.path().join("never-built.tar.gz"),
            mode: BackupMode::Full,
            marker: tmp.path().join("m.snar"),
        };

        assert!(Encryptor::new(runner).encrypt(archive, "secret").is_err());
    }

    #[test]
    fn test_zero_length_archive_refused() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let path = tmp.path().join("empty.tar.gz");
        fs::write(&path, b"").unwrap();
        let archive = Archive {
            path,
            mode: BackupMode::Full,
            marker: tmp.path().join("m.snar"),
        };

        let err = Encryptor::new(runner.clone())
            .encrypt(archive, "secret")
            .unwrap_err();
        assert!(err.to_string().contains("zero-length"));
        assert_eq!(runner.invocation_count(), 0);
    }

    #[test]
    fn test_success_replaces_plaintext_with_ciphertext() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let archive = plaintext(tmp.path());
        let plaintext_path = archive.path.clone();
        let expected = tmp
            .path()
            .join("backup-full-host1-2024-06-02_01-02-03.tar.gz.gpg");
        runner.push(FakeResponse::ok().creating(expected.clone(), b"ciphertext"));

        let encrypted = Encryptor::new(runner.clone())
            .encrypt(archive, "secret")
            .unwrap();

        assert_eq!(encrypted.path, expected);
        assert!(!plaintext_path.exists());
        assert!(expected.exists());

        // passphrase travels on stdin, never on the argv
        let invocation = runner.invocation(0);
        assert_eq!(invocation.program, "gpg");
        assert_eq!(invocation.stdin, Some(b"secret\n".to_vec()));
        assert!(!runner.argv(0).iter().any(|a| a.contains("secret")));
        assert!(runner.argv(0).contains(&"AES256".to_string()));
    }

    #[test]
    fn test_failure_retains_plaintext_and_removes_partial_ciphertext() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let archive = plaintext(tmp.path());
        let plaintext_path = archive.path.clone();
        let partial = tmp
            .path()
            .join("backup-full-host1-2024-06-02_01-02-03.tar.gz.gpg");
        runner.push(
            FakeResponse::fail(2, "gpg: encryption failed").creating(partial.clone(), b"trunc"),
        );

        let err = Encryptor::new(runner).encrypt(archive, "secret").unwrap_err();
        assert!(matches!(err, BackupError::Encryption(_)));
        assert!(plaintext_path.exists());
        assert!(!partial.exists());
    }

    #[test]
    fn test_silent_tool_success_without_output_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let archive = plaintext(tmp.path());
        let plaintext_path = archive.path.clone();
        // exit 0 but no ciphertext written

        let err = Encryptor::new(runner).encrypt(archive, "secret").unwrap_err();
        assert!(err.to_string().contains("no ciphertext"));
        assert!(plaintext_path.exists());
    }
}
