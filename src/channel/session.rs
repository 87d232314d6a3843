//! Transport seams: connectors produce sessions, sessions run packed lines.

use std::fmt;

use crate::key::KeyPair;

use super::error::{ConnectError, SessionError};

/// Where a guest listens for SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Destination {
    /// Login user.
    pub user: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Destination {
    /// Builds a destination.
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// `user@host`, as passed to the SSH client.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Raw bytes and exit code returned by a session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawOutput {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Remote exit code.
    pub exit_code: i32,
}

/// One authenticated connection to a guest.
pub trait Session {
    /// Reports whether the transport is still usable.
    fn is_active(&mut self) -> bool;

    /// Runs an already packed command line, feeding `stdin` and then closing
    /// it so the remote process sees end of input.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Lost`] when the transport fails mid-command.
    fn exec(&mut self, line: &str, stdin: Option<&[u8]>) -> Result<RawOutput, SessionError>;

    /// Tears the connection down. Safe to call more than once.
    fn close(&mut self);
}

/// Factory for sessions.
pub trait Connector {
    /// Session type produced by this connector.
    type Session: Session;

    /// Makes one connection attempt.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ConnectError`] when the attempt fails.
    fn connect(
        &self,
        destination: &Destination,
        key: Option<&KeyPair>,
    ) -> Result<Self::Session, ConnectError>;

    /// Reports whether an SSH agent can unlock passphrase protected keys.
    fn agent_available(&self) -> bool;
}
