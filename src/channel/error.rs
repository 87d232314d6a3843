//! Errors raised by the execution channel.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::key::KeyError;
use crate::retry::Classified;

/// Coarse reason a connection attempt failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectFailureKind {
    /// Nothing listens on the port yet.
    Refused,
    /// The peer closed the connection during the handshake.
    Reset,
    /// Host key verification failed.
    HostKey,
    /// The guest rejected the credential, often because the key is not
    /// installed yet.
    Authentication,
    /// The connection attempt timed out.
    Timeout,
    /// Any other network-level failure.
    Network,
    /// The local SSH client could not be started.
    Launch,
}

impl fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Refused => "connection refused",
            Self::Reset => "connection reset",
            Self::HostKey => "host key rejected",
            Self::Authentication => "authentication failed",
            Self::Timeout => "connection timed out",
            Self::Network => "network failure",
            Self::Launch => "ssh client failed to start",
        };
        f.write_str(label)
    }
}

/// Failures worth retrying while a guest boots.
pub const RETRYABLE_CONNECT_FAILURES: &[ConnectFailureKind] = &[
    ConnectFailureKind::Refused,
    ConnectFailureKind::Reset,
    ConnectFailureKind::HostKey,
    ConnectFailureKind::Authentication,
    ConnectFailureKind::Timeout,
    ConnectFailureKind::Network,
];

/// A single failed connection attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind}: {message}")]
pub struct ConnectError {
    /// Classified reason.
    pub kind: ConnectFailureKind,
    /// Diagnostic text from the client.
    pub message: String,
}

impl ConnectError {
    /// Builds a connection error.
    #[must_use]
    pub fn new(kind: ConnectFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Classified for ConnectError {
    type Kind = ConnectFailureKind;

    fn kind(&self) -> Self::Kind {
        self.kind
    }
}

/// Failures of an established session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The transport died while a command was in flight.
    #[error("session lost: {0}")]
    Lost(String),
    /// The local SSH client could not be started.
    #[error("failed to launch ssh client: {0}")]
    Launch(String),
}

/// Why a guest could not be reached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnreachableCause {
    /// Every connection attempt failed.
    Connect {
        /// Attempts made.
        attempts: u32,
        /// Last failure observed.
        last: ConnectError,
    },
    /// The session dropped mid-command.
    Lost {
        /// Diagnostic text from the client.
        message: String,
    },
}

impl fmt::Display for UnreachableCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { attempts, last } => {
                write!(f, "{attempts} connection attempts failed, last: {last}")
            }
            Self::Lost { message } => write!(f, "session lost: {message}"),
        }
    }
}

/// Errors surfaced by [`ExecutionChannel`](super::ExecutionChannel).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ChannelError {
    /// The private key needs a passphrase and no agent can supply it.
    #[error("private key {path} is passphrase protected and no ssh agent is available")]
    EncryptedKey {
        /// Private key path.
        path: Utf8PathBuf,
    },
    /// The key material could not be read.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// The guest could not be reached.
    #[error("{destination} unreachable: {cause}")]
    Unreachable {
        /// Rendered destination.
        destination: String,
        /// What went wrong.
        cause: UnreachableCause,
    },
    /// The local SSH client could not be started.
    #[error("failed to launch ssh client: {message}")]
    Launch {
        /// Operating system error text.
        message: String,
    },
}

impl ChannelError {
    /// Returns `true` for transport failures that may clear up on their own.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Returns `true` when an established session dropped mid-command, as
    /// opposed to the guest never accepting a connection.
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Self::Unreachable {
                cause: UnreachableCause::Lost { .. },
                ..
            }
        )
    }

    /// Returns `true` for local configuration or credential problems that no
    /// amount of waiting fixes.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        !self.is_unreachable()
    }
}
