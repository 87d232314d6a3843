//! Local process execution behind a trait so the OpenSSH transport can be
//! driven by fakes in tests.

use std::ffi::OsString;
use std::io::{self, Write};
use std::process::{Command, Stdio};

/// Result of running a local command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, or `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program`, writing `stdin` (if any) and capturing both output
    /// streams.
    ///
    /// # Errors
    ///
    /// Returns the spawn error when the program cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput>;

    /// Runs `program` with every standard stream closed and returns only its
    /// exit code. Used for clients that fork into the background.
    ///
    /// # Errors
    ///
    /// Returns the spawn error when the program cannot be started.
    fn run_detached(&self, program: &str, args: &[OsString]) -> io::Result<Option<i32>>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&[u8]>,
    ) -> io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pipe = child.stdin.take();
        let output = std::thread::scope(|scope| {
            if let (Some(mut handle), Some(bytes)) = (pipe, stdin) {
                scope.spawn(move || {
                    // A remote process may exit without reading its input.
                    handle.write_all(bytes).ok();
                });
            }
            child.wait_with_output()
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn run_detached(&self, program: &str, args: &[OsString]) -> io::Result<Option<i32>> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.code())
    }
}
