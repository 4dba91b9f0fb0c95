//! Interactive configuration wizard
//!
//! A one-time setup form, external to the backup pipeline itself: it exposes
//! a single operation that collects the configuration interactively and
//! persists it. The passphrase is read without echo (`rpassword`) and
//! confirmed; everything else is a line prompt with a default.

use crate::config::Configuration;
use crate::error::{BackupError, Result};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Collect the configuration interactively and persist it to `path`
pub fn collect_and_persist_configuration(path: &Path) -> Result<Configuration> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    let config = collect(&mut input, &mut output, prompt_passphrase)?;
    config.persist(path)?;
    info!("Setup complete; configuration stored at {:?}", path);
    Ok(config)
}

fn prompt_passphrase() -> Result<String> {
    let first = rpassword::prompt_password("Symmetric passphrase: ")?;
    if first.is_empty() {
        return Err(BackupError::invalid_input("passphrase", "must not be empty"));
    }
    let second = rpassword::prompt_password("Repeat passphrase: ")?;
    if first != second {
        return Err(BackupError::invalid_input(
            "passphrase",
            "entries did not match",
        ));
    }
    Ok(first)
}

/// Run the form against arbitrary streams (separated for testing)
fn collect(
    input: &mut impl BufRead,
    output: &mut impl Write,
    passphrase: impl Fn() -> Result<String>,
) -> Result<Configuration> {
    writeln!(output, "snapvault setup - answer each prompt (enter keeps the default)")?;

    let remote_user = ask(input, output, "Remote user", "backup")?;
    let remote_host = ask(input, output, "Remote host", "")?;
    let remote_port: u16 = parse_field("remote_port", &ask(input, output, "Remote port", "22")?)?;
    let identity_file = PathBuf::from(ask(
        input,
        output,
        "SSH private key path",
        "/root/.ssh/id_rsa",
    )?);
    let local_root = PathBuf::from(ask(
        input,
        output,
        "Local backup directory",
        "/var/backups/snapvault",
    )?);
    let remote_root = ask(input, output, "Remote backup directory", "")?;
    let bandwidth_limit_kb: u32 = parse_field(
        "bandwidth_limit_kb",
        &ask(input, output, "Bandwidth limit (KB/s)", "4096")?,
    )?;
    let full_backup_weekday: u32 = parse_field(
        "full_backup_weekday",
        &ask(input, output, "Full backup weekday (1=Mon .. 7=Sun)", "7")?,
    )?;
    let delete_after_transfer =
        ask(input, output, "Delete local copy after transfer? (yes/no)", "no")?
            .eq_ignore_ascii_case("yes");
    let passphrase = passphrase()?;

    let config = Configuration {
        remote_user,
        remote_host,
        remote_port,
        identity_file,
        passphrase,
        local_root,
        remote_root,
        bandwidth_limit_kb,
        full_backup_weekday,
        delete_after_transfer,
    };
    config.validate()?;
    Ok(config)
}

fn ask(
    input: &mut impl BufRead,
    output: &mut impl Write,
    label: &str,
    default: &str,
) -> Result<String> {
    if default.is_empty() {
        write!(output, "{}: ", label)?;
    } else {
        write!(output, "{} [{}]: ", label, default)?;
    }
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim();
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    })
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BackupError::invalid_input(field, format!("'{}' is not a valid number", value)))
}
