//! Command execution seam for the external tools
//!
//! The archiving, encryption, and transfer tools are black boxes behind a
//! command contract. [`CommandRunner`] is the seam: production code uses
//! [`SystemRunner`] (exec-style argv, no shell interpretation), while stage
//! tests substitute a recording fake to exercise failure paths without the
//! real binaries.

use crate::error::Result;
use std::ffi::OsString;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name, resolved via PATH
    pub program: String,
    /// Arguments, passed verbatim as argv entries
    pub args: Vec<OsString>,
    /// Bytes fed to the child's stdin (used for the gpg passphrase)
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Create a spec with no stdin payload
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the stdin payload
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

/// Captured result of a tool invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the child was killed by a signal
    pub status: Option<i32>,
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Whether the tool exited with status zero
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stderr as lossy UTF-8, trimmed, for diagnostics
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Executes [`CommandSpec`]s
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing output
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Production runner backed by `std::process::Command`
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {} with {} args", spec.program, spec.args.len());
        trace!("Arguments: {:?}", spec.args);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(bytes) = &spec.stdin {
            // take() closes the pipe once the payload is written
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes)?;
            }
        }
        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
