//! Run log: formatting and size-based rotation
//!
//! Log records are appended to a single file as
//! `[<ISO-like timestamp>] [<LEVEL>] <message>`. Once the file exceeds
//! [`MAX_LOG_SIZE`] it is rotated: the old file is renamed with a `.1`
//! suffix and a fresh file is started. Built on `tracing-subscriber` with a
//! custom event format and `MakeWriter`.

use crate::error::{BackupError, Result};
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Rotation threshold: 10 MiB
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Suffix given to the rotated-out file
pub const ROTATED_SUFFIX: &str = ".1";

/// `[<timestamp>] [<LEVEL>] <message>` event format
pub struct RecordFormat;

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "[{}] [{}] ",
            Local::now().format("%Y-%m-%dT%H:%M:%S"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: PathBuf, max_size: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(RotatingFile {
            path,
            max_size,
            file,
            written,
        })
    }

    fn rotate_if_needed(&mut self) -> io::Result<()> {
        if self.written < self.max_size {
            return Ok(());
        }
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(ROTATED_SUFFIX);
        // rename replaces any previous rotated file
        fs::rename(&self.path, &rotated)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed()?;
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Size-rotating log file writer
///
/// Cloneable handle; all clones share one file and rotation state.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingFileWriter {
    /// Open (or create) the log file at `path`
    pub fn open(path: PathBuf, max_size: u64) -> Result<Self> {
        let inner = RotatingFile::open(path, max_size)?;
        Ok(RotatingFileWriter {
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.lock() {
            Ok(mut file) => file.write(buf),
            Err(_) => Err(io::Error::other("log writer lock poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Err(io::Error::other("log writer lock poisoned")),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber writing to `log_path`
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(log_path: &Path) -> Result<()> {
    let writer = RotatingFileWriter::open(log_path.to_path_buf(), MAX_LOG_SIZE)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(RecordFormat)
        .with_writer(writer)
        .try_init()
        .map_err(|e| BackupError::Io(io::Error::other(e.to_string())))?;
    Ok(())
}
