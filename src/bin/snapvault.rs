//! # snapvault CLI
//!
//! Runs one scheduled backup cycle: archive, encrypt, transfer.
//!
//! ```bash
//! # one-time interactive setup (writes /etc/snapvault/config.toml)
//! snapvault --configure-me
//!
//! # back up /home and /etc, leaving the cache out
//! snapvault --source=/home --source=/etc --exclude-this=/home/nobody/.cache
//! ```
//!
//! Backup runs must be executed with elevated privileges. Failures print a
//! generic message and exit non-zero; the full diagnostic goes to the log.

use clap::Parser;
use colored::*;
use humantime::format_duration;
use snapvault::{
    logging, wizard, BackupError, BackupOrchestrator, Configuration, RunContext, SystemRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Default location of the run log
const DEFAULT_LOG_PATH: &str = "/var/log/snapvault.log";

/// snapvault - scheduled incremental backups, encrypted and shipped off-host
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(version)]
#[command(about = "Weekly full / daily differential backups, encrypted and pushed to a remote host")]
#[command(long_about = None)]
struct Cli {
    /// Path to back up (repeatable)
    #[arg(long = "source", required_unless_present = "configure_me")]
    source: Vec<PathBuf>,

    /// Path to exclude (repeatable or comma-joined)
    #[arg(long = "exclude-this", value_delimiter = ',')]
    exclude_this: Vec<PathBuf>,

    /// Run the interactive setup wizard and exit
    #[arg(long = "configure-me")]
    configure_me: bool,

    /// Configuration file location
    #[arg(long, default_value = snapvault::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log file location
    #[arg(long, default_value = DEFAULT_LOG_PATH)]
    log_file: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let log_file = cli.log_file.clone();
    let mut log_ready = false;

    if let Err(e) = run(cli, &mut log_ready) {
        eprintln!("{}: {}", "Error".red().bold(), e.operator_message());
        // failures before logging came up have nothing in the log to point at
        if log_ready {
            eprintln!("See {} for details.", log_file.display());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli, log_ready: &mut bool) -> Result<(), BackupError> {
    if cli.configure_me {
        wizard::collect_and_persist_configuration(&cli.config)?;
        println!("{} configuration written to {}", "✓".green(), cli.config.display());
        return Ok(());
    }

    // fatal preconditions, checked before any stage runs
    if !nix::unistd::geteuid().is_root() {
        return Err(BackupError::Privilege(
            "backup runs must be executed as root".to_string(),
        ));
    }
    logging::init(&cli.log_file)?;
    *log_ready = true;

    let config = Configuration::load(&cli.config).inspect_err(|e| {
        error!("Configuration error: {}", e);
    })?;
    let ctx = RunContext::new(
        &config,
        cli.source,
        cli.exclude_this,
        chrono::Local::now(),
    )
    .inspect_err(|e| {
        error!("Invalid run context: {}", e);
    })?;

    info!(
        "snapvault {} starting: {} backup of {} source(s)",
        env!("CARGO_PKG_VERSION"),
        ctx.mode,
        ctx.sources.len()
    );

    let orchestrator = BackupOrchestrator::new(config, Arc::new(SystemRunner));
    // stage failures are logged by the orchestrator with full detail
    let report = orchestrator.run(&ctx).map_err(|failure| failure.cause)?;

    println!(
        "{} {} backup complete: {} ({} bytes) in {}",
        "✓".green(),
        report.mode,
        report.encrypted_path.display(),
        report.bytes,
        format_duration(Duration::from_secs(report.duration.as_secs()))
    );
    Ok(())
}
