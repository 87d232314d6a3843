//! Errors raised by [`Instance`](super::Instance) operations.

use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::readiness::{BootIdError, ReadinessError};

/// Failures of lifecycle and guest operations. `E` is the backend's error
/// type.
#[derive(Debug, Error)]
pub enum InstanceError<E>
where
    E: std::error::Error + 'static,
{
    /// The backend rejected a request.
    #[error("backend failed to {operation}: {source}")]
    Backend {
        /// Operation that failed.
        operation: &'static str,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Waiting for readiness failed.
    #[error(transparent)]
    Readiness(#[from] ReadinessError<E>),
    /// The boot identity could not be read.
    #[error(transparent)]
    BootId(#[from] BootIdError),
    /// A stop or delete had not completed within its budget.
    #[error("{operation} still pending after {budget:?}")]
    Pending {
        /// Operation that did not complete.
        operation: &'static str,
        /// Budget that was exhausted.
        budget: Duration,
    },
    /// The instance has been deleted.
    #[error("instance {id} has been deleted")]
    Terminal {
        /// Instance identifier.
        id: String,
    },
    /// A file transfer failed or was incomplete.
    #[error("transfer of {path} failed: {message}")]
    Transfer {
        /// Path being transferred.
        path: String,
        /// Description of the failure.
        message: String,
    },
}

impl<E> InstanceError<E>
where
    E: std::error::Error + 'static,
{
    pub(super) fn backend(operation: &'static str) -> impl FnOnce(E) -> Self {
        move |source| Self::Backend { operation, source }
    }

    pub(super) fn transfer(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.into(),
        }
    }
}
