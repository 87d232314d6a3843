//! Backend abstraction over infrastructure providers.
//!
//! A backend knows how to ask its provider to start, stop, reboot, or delete
//! an instance and how to learn when those requests have structurally
//! completed. Everything that happens inside the guest is the orchestrator's
//! job.

use std::fmt;

/// Provider resource the orchestrator manages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Zone or region, when the provider scopes identifiers by location.
    pub zone: Option<String>,
    /// Address used to reach the guest over SSH.
    pub address: String,
    /// TCP port for SSH.
    pub ssh_port: u16,
}

impl InstanceHandle {
    /// Creates a handle reachable on port 22.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            zone: None,
            address: address.into(),
            ssh_port: 22,
        }
    }

    /// Sets the zone.
    #[must_use]
    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Sets the SSH port.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.zone {
            Some(zone) => write!(f, "{zone}/{}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Coarse power state reported by a provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Starting or otherwise in transition towards running.
    Pending,
    /// Running.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped but still allocated.
    Stopped,
    /// No longer exists.
    Gone,
}

/// How a backend handled a reboot request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebootRequest {
    /// The provider accepted the reboot.
    Issued,
    /// The provider has no reboot call; the guest must reboot itself.
    Guest,
}

/// What to do when a stop or delete is still pending after its budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingPolicy {
    /// Raise an error.
    Fail,
    /// Log a warning and carry on, for resources that clean up after
    /// themselves.
    Warn,
}

/// Minimal interface implemented by infrastructure backends.
///
/// Calls block until the provider has acknowledged the request; waiting for
/// the resulting state is driven by the orchestrator.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the current address of the instance.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the lookup fails.
    fn resolve_address(&self, handle: &InstanceHandle) -> Result<String, Self::Error>;

    /// Asks the provider to power the instance on.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the request is rejected.
    fn request_start(&self, handle: &InstanceHandle) -> Result<(), Self::Error>;

    /// Asks the provider to power the instance off.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the request is rejected.
    fn request_stop(&self, handle: &InstanceHandle) -> Result<(), Self::Error>;

    /// Asks the provider to reboot the instance.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the request is rejected.
    fn request_reboot(&self, handle: &InstanceHandle) -> Result<RebootRequest, Self::Error>;

    /// Asks the provider to delete the instance.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the request is rejected.
    fn request_delete(&self, handle: &InstanceHandle) -> Result<(), Self::Error>;

    /// Reports the provider's view of the power state, or `None` when the
    /// provider offers no such signal.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the lookup fails.
    fn power_state(&self, handle: &InstanceHandle) -> Result<Option<PowerState>, Self::Error> {
        let _ = handle;
        Ok(None)
    }

    /// Reports whether a stop has completed.
    ///
    /// Without a power-state signal the stop is assumed complete.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the lookup fails.
    fn is_stopped(&self, handle: &InstanceHandle) -> Result<bool, Self::Error> {
        Ok(self
            .power_state(handle)?
            .is_none_or(|state| matches!(state, PowerState::Stopped | PowerState::Gone)))
    }

    /// Reports whether a delete has completed.
    ///
    /// Without a power-state signal the delete is assumed complete.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the lookup fails.
    fn is_deleted(&self, handle: &InstanceHandle) -> Result<bool, Self::Error> {
        Ok(self
            .power_state(handle)?
            .is_none_or(|state| state == PowerState::Gone))
    }

    /// Policy applied when a delete is still pending after its budget.
    fn delete_policy(&self) -> PendingPolicy {
        PendingPolicy::Fail
    }
}
