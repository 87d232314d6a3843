//! Remote execution channel.
//!
//! An [`ExecutionChannel`] owns at most one live [`Session`] to a guest. The
//! session is opened lazily on the first command, reused while it stays
//! active, and replaced transparently once it dies. Every command is packed
//! with [`shell_pack`](crate::shell::shell_pack) so the guest's login shell
//! never reinterprets its arguments.

mod error;
mod openssh;
mod process;
mod session;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::key::KeyPair;
use crate::outcome::CommandOutcome;
use crate::retry::{Backoff, Clock, RetryError};
use crate::shell::{RemoteCommand, shell_pack, shell_quote};

pub use error::{
    ChannelError, ConnectError, ConnectFailureKind, RETRYABLE_CONNECT_FAILURES, SessionError,
    UnreachableCause,
};
pub use openssh::{
    OpenSshConnector, OpenSshSession, SshOptions, classify_connect_failure, default_control_dir,
};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use session::{Connector, Destination, RawOutput, Session};

/// Connection retry settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelSettings {
    /// Connection attempts before the guest is declared unreachable.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub connect_interval: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 30,
            connect_interval: Duration::from_secs(10),
        }
    }
}

/// Runs commands on one guest over a lazily opened, reused session.
pub struct ExecutionChannel<C: Connector> {
    connector: C,
    destination: Destination,
    key: Option<Arc<KeyPair>>,
    settings: ChannelSettings,
    clock: Arc<dyn Clock>,
    session: Option<C::Session>,
}

impl<C: Connector> ExecutionChannel<C> {
    /// Creates a channel. No connection is made until the first command.
    #[must_use]
    pub fn new(
        connector: C,
        destination: Destination,
        key: Option<Arc<KeyPair>>,
        settings: ChannelSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            destination,
            key,
            settings,
            clock,
            session: None,
        }
    }

    /// Current destination.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Connector used to open sessions.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns `true` while a session is cached. The session may still turn
    /// out to be dead on next use.
    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Runs `command` on the guest and returns its outcome.
    ///
    /// `stdin`, when supplied, is written in full and then closed. A non-zero
    /// exit code is returned as data.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::EncryptedKey`] or [`ChannelError::Key`] before
    /// any connection attempt when the credential is unusable,
    /// [`ChannelError::Unreachable`] when connecting fails after every retry
    /// or the session drops mid-command, and [`ChannelError::Launch`] when the
    /// SSH client cannot be started.
    pub fn execute(
        &mut self,
        command: impl Into<RemoteCommand>,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutcome, ChannelError> {
        let attempts = self.settings.connect_attempts;
        self.run(command.into(), stdin, attempts)
    }

    /// Like [`execute`](Self::execute), but makes at most one connection
    /// attempt when no live session is cached.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_once(
        &mut self,
        command: impl Into<RemoteCommand>,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutcome, ChannelError> {
        self.run(command.into(), stdin, 1)
    }

    fn run(
        &mut self,
        command: RemoteCommand,
        stdin: Option<&[u8]>,
        connect_attempts: u32,
    ) -> Result<CommandOutcome, ChannelError> {
        let argv = command.into_argv();
        debug!(destination = %self.destination, command = %shell_quote(&argv), "executing");
        let line = shell_pack(&argv);

        let result = self.session(connect_attempts)?.exec(&line, stdin);
        match result {
            Ok(raw) => Ok(CommandOutcome::from_bytes(
                &raw.stdout,
                &raw.stderr,
                raw.exit_code,
            )),
            Err(SessionError::Lost(message)) => {
                self.disconnect();
                Err(ChannelError::Unreachable {
                    destination: self.destination.to_string(),
                    cause: UnreachableCause::Lost { message },
                })
            }
            Err(SessionError::Launch(message)) => {
                self.disconnect();
                Err(ChannelError::Launch { message })
            }
        }
    }

    /// Closes the cached session, if any.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    /// Points the channel at a new destination, dropping the current
    /// session.
    pub fn retarget(&mut self, destination: Destination) {
        if destination != self.destination {
            info!(from = %self.destination, to = %destination, "retargeting channel");
            self.disconnect();
            self.destination = destination;
        }
    }

    fn session(&mut self, connect_attempts: u32) -> Result<&mut C::Session, ChannelError> {
        let session = match self.session.take() {
            Some(mut existing) => {
                if existing.is_active() {
                    existing
                } else {
                    debug!(destination = %self.destination, "session inactive; reconnecting");
                    existing.close();
                    self.connect(connect_attempts)?
                }
            }
            None => self.connect(connect_attempts)?,
        };
        Ok(self.session.insert(session))
    }

    fn check_credentials(&self) -> Result<(), ChannelError> {
        let Some(key) = self.key.as_deref() else {
            return Ok(());
        };
        if key.requires_passphrase()? && !self.connector.agent_available() {
            return Err(ChannelError::EncryptedKey {
                path: key.private_key_path().to_path_buf(),
            });
        }
        Ok(())
    }

    fn connect(&self, attempts: u32) -> Result<C::Session, ChannelError> {
        self.check_credentials()?;
        let policy = Backoff::fixed(attempts, self.settings.connect_interval);
        policy
            .retry_on(
                self.clock.as_ref(),
                RETRYABLE_CONNECT_FAILURES,
                |attempt| {
                    debug!(
                        destination = %self.destination,
                        attempt = attempt.saturating_add(1),
                        "connecting"
                    );
                    self.connector.connect(&self.destination, self.key.as_deref())
                },
            )
            .map_err(|err| match err {
                RetryError::Exhausted {
                    attempts, source, ..
                } => ChannelError::Unreachable {
                    destination: self.destination.to_string(),
                    cause: UnreachableCause::Connect {
                        attempts,
                        last: source,
                    },
                },
                RetryError::Aborted(source) => ChannelError::Launch {
                    message: source.message,
                },
            })
    }
}

impl<C: Connector> Drop for ExecutionChannel<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<C: Connector> std::fmt::Debug for ExecutionChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionChannel")
            .field("destination", &self.destination)
            .field("settings", &self.settings)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
