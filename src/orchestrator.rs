//! Top-level backup state machine
//!
//! Drives one run through its stages, strictly sequentially:
//!
//! ```text
//! Idle → ModeSelected → Archived → Encrypted → Transferred → Done
//!                  \________ Failed(stage, cause) ________/
//! ```
//!
//! The first failure is terminal for the run — there is no automatic retry;
//! the next scheduled invocation is the retry mechanism, relying on the
//! snapshot store's idempotence (full-marker overwrite is safe to repeat,
//! differential forking takes a fresh index each time). On entering the
//! failed state the filesystem is in a safe shape: either no artifact for
//! this run, or one complete plaintext or complete ciphertext — never a
//! truncated file that could be mistaken for complete.

use crate::archive::ArchiveBuilder;
use crate::command::CommandRunner;
use crate::config::Configuration;
use crate::context::{BackupMode, RunContext, CIPHERTEXT_SUFFIX};
use crate::encrypt::Encryptor;
use crate::error::BackupError;
use crate::lock::RunLock;
use crate::snapshot::SnapshotStore;
use crate::transfer::{SshOptions, Transporter};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

/// Pipeline stage, named in failure reports and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Lock acquisition and stale-artifact recovery
    Preflight,
    /// Archive construction
    Archive,
    /// Encryption at rest
    Encrypt,
    /// Push to the remote host
    Transfer,
    /// Local retention handling after a successful transfer
    Finalize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::Archive => "archive",
            Stage::Encrypt => "encrypt",
            Stage::Transfer => "transfer",
            Stage::Finalize => "finalize",
        };
        write!(f, "{}", name)
    }
}

/// Observable state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    ModeSelected,
    Archived,
    Encrypted,
    Transferred,
    Done,
    Failed(Stage),
}

/// Terminal failure of a run: which stage died, and why
#[derive(Debug, Error)]
#[error("run failed in {stage} stage: {cause}")]
pub struct StageFailure {
    /// Stage the run died in
    pub stage: Stage,
    /// Underlying error, with full diagnostic detail
    #[source]
    pub cause: BackupError,
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Mode the run executed in
    pub mode: BackupMode,
    /// Local path of the encrypted artifact (retained unless configured away)
    pub encrypted_path: PathBuf,
    /// Size of the encrypted artifact in bytes
    pub bytes: u64,
    /// Wall-clock duration of the run
    pub duration: Duration,
    /// Whether the local ciphertext was removed after transfer
    pub local_copy_deleted: bool,
}

/// Coordinates one backup run end to end
pub struct BackupOrchestrator {
    config: Configuration,
    runner: Arc<dyn CommandRunner>,
}

impl BackupOrchestrator {
    /// Create an orchestrator over the given configuration and tool runner
    pub fn new(config: Configuration, runner: Arc<dyn CommandRunner>) -> Self {
        BackupOrchestrator { config, runner }
    }

    /// Execute one run
    ///
    /// Stages run strictly in sequence with no internal parallelism; the
    /// first failing stage aborts the run.
    #[instrument(skip(self, ctx), fields(machine = %ctx.machine, mode = %ctx.mode))]
    pub fn run(&self, ctx: &RunContext) -> std::result::Result<RunReport, StageFailure> {
        let start = Instant::now();
        let mut state = RunState::Idle;
        transition(&mut state, RunState::ModeSelected);
        info!(
            "Starting {} backup for machine '{}' at {}",
            ctx.mode, ctx.machine, ctx.timestamp
        );

        // Preflight: lock out overlapping runs, then clean up what a killed
        // run may have left behind
        let store = SnapshotStore::open(&self.config.local_root)
            .map_err(|e| fail(&mut state, Stage::Preflight, e))?;
        let _lock = RunLock::acquire(store.root(), &ctx.machine)
            .map_err(|e| fail(&mut state, Stage::Preflight, e))?;
        self.recover_stale_artifacts(&store, &ctx.machine)
            .map_err(|e| fail(&mut state, Stage::Preflight, e))?;

        let builder = ArchiveBuilder::new(Arc::clone(&self.runner), store);
        let archive = builder
            .build(ctx)
            .map_err(|e| fail(&mut state, Stage::Archive, e))?;
        transition(&mut state, RunState::Archived);

        let encrypted = Encryptor::new(Arc::clone(&self.runner))
            .encrypt(archive, &self.config.passphrase)
            .map_err(|e| fail(&mut state, Stage::Encrypt, e))?;
        transition(&mut state, RunState::Encrypted);

        let transporter = Transporter::new(
            Arc::clone(&self.runner),
            self.config.rsync_target(),
            Some(SshOptions {
                port: self.config.remote_port,
                identity_file: self.config.identity_file.clone(),
            }),
            self.config.bandwidth_limit_kb,
        );
        transporter
            .send(std::slice::from_ref(&encrypted))
            .map_err(|e| fail(&mut state, Stage::Transfer, e))?;
        transition(&mut state, RunState::Transferred);

        let bytes = fs::metadata(&encrypted.path).map(|m| m.len()).unwrap_or(0);
        let mut local_copy_deleted = false;
        if self.config.delete_after_transfer {
            fs::remove_file(&encrypted.path)
                .map_err(|e| fail(&mut state, Stage::Finalize, e.into()))?;
            local_copy_deleted = true;
            info!("Removed local retention copy {:?}", encrypted.path);
        }
        transition(&mut state, RunState::Done);

        let duration = start.elapsed();
        info!(
            "Run complete: {} backup, {} bytes, {:.1}s",
            encrypted.mode,
            bytes,
            duration.as_secs_f64()
        );
        Ok(RunReport {
            mode: encrypted.mode,
            encrypted_path: encrypted.path,
            bytes,
            duration,
            local_copy_deleted,
        })
    }

    /// Remove half-written artifacts left by a run that was killed
    ///
    /// A plaintext archive on disk means a prior run died before its
    /// encryption completed. Its ciphertext sibling, if any, cannot be
    /// trusted (the plaintext is only removed after a verified encryption),
    /// so both are removed. Lone ciphertexts are complete retention copies
    /// and stay.
    fn recover_stale_artifacts(
        &self,
        store: &SnapshotStore,
        machine: &str,
    ) -> crate::error::Result<()> {
        let prefixes = [
            format!("backup-full-{}-", machine),
            format!("backup-diff-{}-", machine),
        ];
        for entry in WalkDir::new(store.root()).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_plaintext =
                prefixes.iter().any(|p| name.starts_with(p)) && name.ends_with(".tar.gz");
            if !is_plaintext {
                continue;
            }

            let plaintext = entry.path().to_path_buf();
            let mut ciphertext = plaintext.clone().into_os_string();
            ciphertext.push(CIPHERTEXT_SUFFIX);
            let ciphertext = PathBuf::from(ciphertext);
            if ciphertext.exists() {
                warn!("Removing untrusted ciphertext {:?} from dead run", ciphertext);
                fs::remove_file(&ciphertext)?;
            }
            warn!("Removing stale plaintext {:?} from dead run", plaintext);
            fs::remove_file(&plaintext)?;
        }
        Ok(())
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!("State {:?} -> {:?}", state, next);
    *state = next;
}

fn fail(state: &mut RunState, stage: Stage, cause: BackupError) -> StageFailure {
    transition(state, RunState::Failed(stage));
    error!("Run failed in {} stage: {}", stage, cause);
    StageFailure { stage, cause }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{FakeRunner, FakeResponse};
    use chrono::{Local, TimeZone};
    use tempfile::TempDir;

    fn config(root: &std::path::Path) -> Configuration {
        Configuration {
            remote_user: "backup".to_string(),
            remote_host: "vault".to_string(),
            remote_port: 22,
            identity_file: PathBuf::from("/root/.ssh/id_backup"),
            passphrase: "secret".to_string(),
            local_root: root.to_path_buf(),
            remote_root: "/srv/backups".to_string(),
            bandwidth_limit_kb: 1024,
            full_backup_weekday: 7,
            delete_after_transfer: false,
        }
    }

    fn context(root: &std::path::Path, sunday: bool) -> RunContext {
        let day = if sunday { 2 } else { 3 }; // 2024-06-02 is a Sunday
        let now = Local.with_ymd_and_hms(2024, 6, day, 1, 2, 3).unwrap();
        let mut ctx = RunContext::new(
            &config(root),
            vec![PathBuf::from("/etc")],
            vec![],
            now,
        )
        .unwrap();
        ctx.machine = "host1".to_string();
        ctx
    }

    /// Queue tar + gpg responses that behave like the real tools
    fn script_happy_path(runner: &FakeRunner, root: &std::path::Path, ctx: &RunContext) {
        let archive = root.join(ctx.archive_file_name());
        let mut ciphertext = archive.clone().into_os_string();
        ciphertext.push(".gpg");
        let mut tar = FakeResponse::ok().creating(archive, b"tarball");
        if ctx.mode == BackupMode::Full {
            // a full pass initializes the marker itself; a differential
            // pass updates the already-forked copy in place
            tar = tar.creating(root.join("backup-full-host1.snar"), b"snar-state");
        }
        runner.push(tar);
        runner.push(FakeResponse::ok().creating(PathBuf::from(ciphertext), b"ciphertext"));
        runner.push(FakeResponse::ok()); // rsync
    }

    #[test]
    fn test_successful_sunday_run_leaves_only_ciphertext() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        script_happy_path(&runner, tmp.path(), &ctx);

        let orchestrator = BackupOrchestrator::new(config(tmp.path()), runner.clone());
        let report = orchestrator.run(&ctx).unwrap();

        assert_eq!(report.mode, BackupMode::Full);
        assert!(report.encrypted_path.exists());
        assert!(!report.local_copy_deleted);
        // plaintext consumed, marker stays local
        assert!(!tmp.path().join(ctx.archive_file_name()).exists());
        assert!(tmp.path().join("backup-full-host1.snar").exists());
        // tar, gpg, rsync, in that order and nothing else
        assert_eq!(runner.invocation_count(), 3);
        assert_eq!(runner.invocation(0).program, "tar");
        assert_eq!(runner.invocation(1).program, "gpg");
        assert_eq!(runner.invocation(2).program, "rsync");
    }

    #[test]
    fn test_rsync_never_sees_markers() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        script_happy_path(&runner, tmp.path(), &ctx);

        BackupOrchestrator::new(config(tmp.path()), runner.clone())
            .run(&ctx)
            .unwrap();

        let rsync_argv = runner.argv(2);
        assert!(rsync_argv
            .iter()
            .all(|a| !a.ends_with(".snar") || a.starts_with("--exclude")));
        assert!(rsync_argv.iter().any(|a| a.ends_with(".tar.gz.gpg")));
    }

    #[test]
    fn test_archive_failure_aborts_before_encryption() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        runner.push(FakeResponse::fail(2, "tar: cannot open"));

        let failure = BackupOrchestrator::new(config(tmp.path()), runner.clone())
            .run(&ctx)
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Archive);
        assert!(matches!(failure.cause, BackupError::Build(_)));
        // nothing ran after tar, no artifact left behind
        assert_eq!(runner.invocation_count(), 1);
        assert!(!tmp.path().join(ctx.archive_file_name()).exists());
    }

    #[test]
    fn test_encryption_failure_keeps_plaintext() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        let archive = tmp.path().join(ctx.archive_file_name());
        runner.push(FakeResponse::ok().creating(archive.clone(), b"tarball"));
        runner.push(FakeResponse::fail(2, "gpg: bad things"));

        let failure = BackupOrchestrator::new(config(tmp.path()), runner.clone())
            .run(&ctx)
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Encrypt);
        // safe state (b): a complete plaintext, no partial ciphertext
        assert!(archive.exists());
        let mut ciphertext = archive.into_os_string();
        ciphertext.push(".gpg");
        assert!(!PathBuf::from(ciphertext).exists());
        assert_eq!(runner.invocation_count(), 2);
    }

    #[test]
    fn test_transfer_failure_keeps_local_ciphertext() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        let archive = tmp.path().join(ctx.archive_file_name());
        let mut ciphertext = archive.clone().into_os_string();
        ciphertext.push(".gpg");
        let ciphertext = PathBuf::from(ciphertext);
        runner.push(FakeResponse::ok().creating(archive, b"tarball"));
        runner.push(FakeResponse::ok().creating(ciphertext.clone(), b"ciphertext"));
        runner.push(FakeResponse::fail(255, "ssh: unreachable"));

        let failure = BackupOrchestrator::new(config(tmp.path()), runner)
            .run(&ctx)
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Transfer);
        // the retry of the next scheduled run has something to resend
        assert!(ciphertext.exists());
    }

    #[test]
    fn test_stale_plaintext_and_sibling_removed_in_preflight() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);

        // debris from a run that was killed mid-encryption
        let stale = tmp.path().join("backup-full-host1-2024-05-26_01-00-00.tar.gz");
        let stale_cipher = tmp
            .path()
            .join("backup-full-host1-2024-05-26_01-00-00.tar.gz.gpg");
        fs::write(&stale, b"old plaintext").unwrap();
        fs::write(&stale_cipher, b"untrusted").unwrap();
        // a completed run's retention copy must survive
        let retained = tmp.path().join("backup-diff-host1-2024-05-28_01-00-00.tar.gz.gpg");
        fs::write(&retained, b"complete ciphertext").unwrap();

        script_happy_path(&runner, tmp.path(), &ctx);
        BackupOrchestrator::new(config(tmp.path()), runner)
            .run(&ctx)
            .unwrap();

        assert!(!stale.exists());
        assert!(!stale_cipher.exists());
        assert!(retained.exists());
    }

    #[test]
    fn test_delete_after_transfer() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        script_happy_path(&runner, tmp.path(), &ctx);

        let mut cfg = config(tmp.path());
        cfg.delete_after_transfer = true;
        let report = BackupOrchestrator::new(cfg, runner).run(&ctx).unwrap();

        assert!(report.local_copy_deleted);
        assert!(!report.encrypted_path.exists());
    }

    #[test]
    fn test_monday_differential_forks_from_full_marker() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), false);
        assert_eq!(ctx.mode, BackupMode::Differential);

        fs::write(tmp.path().join("backup-full-host1.snar"), b"baseline").unwrap();
        script_happy_path(&runner, tmp.path(), &ctx);

        BackupOrchestrator::new(config(tmp.path()), runner)
            .run(&ctx)
            .unwrap();

        let fork = tmp.path().join("backup-diff-host1-1.snar");
        assert_eq!(fs::read(&fork).unwrap(), b"baseline");
    }

    #[test]
    fn test_differential_before_full_fails_with_store_error() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), false);

        let failure = BackupOrchestrator::new(config(tmp.path()), runner.clone())
            .run(&ctx)
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Archive);
        assert!(matches!(failure.cause, BackupError::MissingFullMarker { .. }));
        assert_eq!(runner.invocation_count(), 0);
    }

    #[test]
    fn test_lock_released_after_failed_run() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let ctx = context(tmp.path(), true);
        runner.push(FakeResponse::fail(2, "tar: boom"));

        let orchestrator = BackupOrchestrator::new(config(tmp.path()), runner.clone());
        orchestrator.run(&ctx).unwrap_err();

        // a second run can acquire the lock again
        script_happy_path(&runner, tmp.path(), &ctx);
        orchestrator.run(&ctx).unwrap();
    }
}
