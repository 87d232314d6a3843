//! Error types for the Scaleway backend.

use crate::config::ConfigError;
use crate::retry::Classified;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// API error types Scaleway uses for conditions that clear up on their own.
const TRANSIENT_API_ERRORS: [&str; 3] = ["transient_state", "service_unavailable", "internal"];

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a launch request is missing a required field.
    #[error("invalid launch request: {0}")]
    Validation(String),
    /// Raised when the blocking runtime cannot be created.
    #[error("failed to start async runtime: {0}")]
    Runtime(String),
    /// Raised when the server type is not available in the selected zone.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when a control-plane wait exceeds its budget.
    #[error("timeout waiting for {action} on instance {instance_id}")]
    Timeout {
        /// Action being waited on.
        action: String,
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when the instance never exposes a public IP.
    #[error("instance {instance_id} missing public IPv4 address")]
    MissingPublicIp {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when the instance no longer exists.
    #[error("instance {instance_id} not found in zone {zone}")]
    NotFound {
        /// Provider instance identifier.
        instance_id: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the provider does not currently allow an action.
    #[error("instance {instance_id} in state {state} does not allow {action}")]
    ActionNotAllowed {
        /// Provider instance identifier.
        instance_id: String,
        /// Action requested.
        action: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
    },
}

/// Coarse classification used to pick retryable failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScalewayFailureKind {
    /// Network trouble or a transient provider state.
    Transient,
    /// Anything retrying cannot fix.
    Permanent,
}

impl ScalewayBackendError {
    pub(super) fn provider(message: impl Into<String>, transient: bool) -> Self {
        Self::Provider {
            message: message.into(),
            transient,
        }
    }
}

impl Classified for ScalewayBackendError {
    type Kind = ScalewayFailureKind;

    fn kind(&self) -> Self::Kind {
        match self {
            Self::Provider {
                transient: true, ..
            } => ScalewayFailureKind::Transient,
            _ => ScalewayFailureKind::Permanent,
        }
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        let transient = match &value {
            ScalewayError::Api(api_err) => TRANSIENT_API_ERRORS.contains(&api_err.etype.as_str()),
            _ => true,
        };
        Self::provider(value.to_string(), transient)
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
