//! Kernel boot identity, the signal that a restart really happened.

use std::fmt;

use thiserror::Error;

use crate::channel::{ChannelError, Connector, ExecutionChannel};
use crate::outcome::CommandOutcome;

/// Guest command printing the boot identity.
pub const BOOT_ID_COMMAND: [&str; 2] = ["cat", "/proc/sys/kernel/random/boot_id"];

/// Identifier the kernel regenerates on every boot.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BootId(String);

impl BootId {
    /// Wraps a raw value, trimming surrounding whitespace. Returns `None`
    /// for blank input.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_owned()))
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reasons the boot identity could not be read. None of them means the
/// guest rebooted.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BootIdError {
    /// The channel failed.
    #[error("failed to read boot id: {0}")]
    Channel(#[from] ChannelError),
    /// The command ran but exited non-zero.
    #[error("reading boot id failed with {0}")]
    CommandFailed(CommandOutcome),
    /// The command succeeded but printed nothing.
    #[error("boot id was empty")]
    Empty,
}

/// Reads the guest's current boot identity.
///
/// # Errors
///
/// Returns [`BootIdError`] when the guest is unreachable, the command fails,
/// or the output is blank.
pub fn get_boot_id<C: Connector>(channel: &mut ExecutionChannel<C>) -> Result<BootId, BootIdError> {
    let outcome = channel.execute(BOOT_ID_COMMAND, None)?;
    if outcome.failed() {
        return Err(BootIdError::CommandFailed(outcome));
    }
    BootId::parse(&outcome.stdout).ok_or(BootIdError::Empty)
}
