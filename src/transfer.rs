//! Remote transfer of encrypted artifacts
//!
//! Pushes completed ciphertexts to the remote backup host with `rsync`.
//! The transfer is resumable (`--partial`) and idempotent: re-running after
//! a partial failure cannot corrupt the remote copy. Snapshot markers are
//! local-only state and are kept out of the transferred set twice over —
//! they are never handed to this stage, and `--exclude=*.snar` guards the
//! tool invocation itself. Local artifacts are never deleted here, so a
//! failed transfer always leaves something to resend.

use crate::command::{CommandRunner, CommandSpec};
use crate::context::MARKER_SUFFIX;
use crate::encrypt::EncryptedArchive;
use crate::error::{BackupError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// SSH transport options for the remote leg
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Remote port
    pub port: u16,
    /// Private key used for authentication
    pub identity_file: PathBuf,
}

impl SshOptions {
    /// Remote-shell argument for rsync's `-e`
    fn remote_shell(&self) -> String {
        format!(
            "ssh -p {} -i {} -o BatchMode=yes",
            self.port,
            self.identity_file.display()
        )
    }
}

/// Pushes encrypted artifacts to the configured destination
pub struct Transporter {
    runner: Arc<dyn CommandRunner>,
    /// rsync destination (`user@host:path/` or a local directory in tests)
    target: String,
    /// SSH options; `None` for local destinations
    ssh: Option<SshOptions>,
    /// Bandwidth cap in KB/s
    bandwidth_limit_kb: u32,
}

impl Transporter {
    /// Create a transporter for one destination
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        target: String,
        ssh: Option<SshOptions>,
        bandwidth_limit_kb: u32,
    ) -> Self {
        Transporter {
            runner,
            target,
            ssh,
            bandwidth_limit_kb,
        }
    }

    /// Send the given artifacts to the destination
    ///
    /// # Errors
    ///
    /// [`BackupError::Transfer`] on any non-zero tool exit; the local
    /// artifacts are left in place for the next scheduled retry.
    #[instrument(skip(self, archives), fields(target = %self.target))]
    pub fn send(&self, archives: &[EncryptedArchive]) -> Result<()> {
        let files: Vec<&PathBuf> = archives
            .iter()
            .map(|a| &a.path)
            .filter(|p| {
                let is_marker = p
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()) == MARKER_SUFFIX)
                    .unwrap_or(false);
                if is_marker {
                    warn!("Refusing to transfer snapshot marker {:?}", p);
                }
                !is_marker
            })
            .collect();
        if files.is_empty() {
            warn!("No artifacts to transfer");
            return Ok(());
        }

        let mut spec = CommandSpec::new("rsync")
            .arg("--archive")
            .arg("--partial")
            .arg(format!("--bwlimit={}", self.bandwidth_limit_kb))
            .arg(format!("--exclude=*{}", MARKER_SUFFIX));
        if let Some(ssh) = &self.ssh {
            spec = spec.arg("-e").arg(ssh.remote_shell());
        }
        for file in &files {
            spec = spec.arg(file.as_os_str());
        }
        spec = spec.arg(&self.target);

        info!("Transferring {} artifact(s) to {}", files.len(), self.target);
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(BackupError::transfer(format!(
                "rsync exited with status {:?}: {}",
                output.status,
                output.stderr_text()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{FakeRunner, FakeResponse};
    use crate::context::BackupMode;

    fn encrypted(path: &str) -> EncryptedArchive {
        EncryptedArchive {
            path: PathBuf::from(path),
            mode: BackupMode::Full,
        }
    }

    fn transporter(runner: Arc<FakeRunner>) -> Transporter {
        Transporter::new(
            runner,
            "backup@vault:/srv/backups/host1/".to_string(),
            Some(SshOptions {
                port: 2222,
                identity_file: PathBuf::from("/root/.ssh/id_backup"),
            }),
            512,
        )
    }

    #[test]
    fn test_rsync_invocation_shape() {
        let runner = Arc::new(FakeRunner::new());
        let t = transporter(runner.clone());
        t.send(&[encrypted("/var/backups/backup-full-host1-x.tar.gz.gpg")])
            .unwrap();

        let argv = runner.argv(0);
        assert_eq!(runner.invocation(0).program, "rsync");
        assert!(argv.contains(&"--archive".to_string()));
        assert!(argv.contains(&"--partial".to_string()));
        assert!(argv.contains(&"--bwlimit=512".to_string()));
        assert!(argv.contains(&"--exclude=*.snar".to_string()));
        assert!(argv.contains(&"ssh -p 2222 -i /root/.ssh/id_backup -o BatchMode=yes".to_string()));
        // destination is the final argument
        assert_eq!(argv.last().unwrap(), "backup@vault:/srv/backups/host1/");
    }

    #[test]
    fn test_markers_never_reach_the_tool() {
        let runner = Arc::new(FakeRunner::new());
        let t = transporter(runner.clone());
        t.send(&[
            encrypted("/var/backups/backup-full-host1-x.tar.gz.gpg"),
            encrypted("/var/backups/backup-full-host1.snar"),
        ])
        .unwrap();

        let argv = runner.argv(0);
        assert!(!argv.iter().any(|a| a.ends_with(".snar")
            && !a.starts_with("--exclude")));
    }

    #[test]
    fn test_failure_surfaces_diagnostic_and_keeps_local_files() {
        let runner = Arc::new(FakeRunner::new());
        runner.push(FakeResponse::fail(255, "ssh: connection refused"));
        let t = transporter(runner);

        let tmp = tempfile::TempDir::new().unwrap();
        let local = tmp.path().join("backup-full-host1-x.tar.gz.gpg");
        std::fs::write(&local, b"ciphertext").unwrap();

        let err = t
            .send(&[EncryptedArchive {
                path: local.clone(),
                mode: BackupMode::Full,
            }])
            .unwrap_err();
        assert!(matches!(err, BackupError::Transfer(_)));
        assert!(err.to_string().contains("connection refused"));
        assert!(local.exists());
    }

    #[test]
    fn test_empty_set_is_a_noop() {
        let runner = Arc::new(FakeRunner::new());
        let t = transporter(runner.clone());
        t.send(&[]).unwrap();
        assert_eq!(runner.invocation_count(), 0);
    }

    #[test]
    fn test_local_target_needs_no_remote_shell() {
        let runner = Arc::new(FakeRunner::new());
        let t = Transporter::new(runner.clone(), "/tmp/dest/".to_string(), None, 128);
        t.send(&[encrypted("/var/backups/a.tar.gz.gpg")]).unwrap();
        assert!(!runner.argv(0).contains(&"-e".to_string()));
    }
}
