//! Captured result of a remote command.

use std::fmt;

use thiserror::Error;

/// Exit code and captured output of a command run on a guest.
///
/// A non-zero exit is data, not an error: callers decide whether a failed
/// outcome matters. Output is decoded lossily as UTF-8 with trailing
/// whitespace removed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutcome {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code reported by the remote process.
    pub exit_code: i32,
}

impl CommandOutcome {
    /// Builds an outcome from already decoded text.
    #[must_use]
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Builds an outcome from raw bytes, trimming trailing whitespace.
    #[must_use]
    pub fn from_bytes(stdout: &[u8], stderr: &[u8], exit_code: i32) -> Self {
        Self {
            stdout: decode(stdout),
            stderr: decode(stderr),
            exit_code,
        }
    }

    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns `true` when the command exited with a non-zero status.
    #[must_use]
    pub const fn failed(&self) -> bool {
        !self.ok()
    }

    /// Promotes a failed outcome to an error.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFailed`] when the exit code is non-zero.
    pub fn ensure_success(self) -> Result<Self, CommandFailed> {
        if self.ok() {
            Ok(self)
        } else {
            Err(CommandFailed { outcome: self })
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit {}", self.exit_code)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

/// Raised when a command that must succeed exits non-zero.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("command failed with {outcome}")]
pub struct CommandFailed {
    /// The failed outcome, kept for diagnostics.
    pub outcome: CommandOutcome,
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_owned()
}
