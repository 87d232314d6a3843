//! Backend for hosts that already exist and are reached only over SSH.

use thiserror::Error;

use crate::backend::{Backend, InstanceHandle, PendingPolicy, RebootRequest};

/// Errors raised by [`StaticHost`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StaticHostError {
    /// The host has no control plane for this operation.
    #[error("{operation} is not supported for static host {host}")]
    Unsupported {
        /// Operation requested.
        operation: &'static str,
        /// Host address.
        host: String,
    },
}

/// A pre-provisioned machine. Reboots are issued from inside the guest and
/// deleting only releases the handle.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticHost;

impl StaticHost {
    /// Handle for `address` reachable on `port`.
    #[must_use]
    pub fn handle(address: &str, port: u16) -> InstanceHandle {
        InstanceHandle::new(format!("static:{address}"), address).with_ssh_port(port)
    }
}

impl Backend for StaticHost {
    type Error = StaticHostError;

    fn resolve_address(&self, handle: &InstanceHandle) -> Result<String, Self::Error> {
        Ok(handle.address.clone())
    }

    fn request_start(&self, handle: &InstanceHandle) -> Result<(), Self::Error> {
        Err(StaticHostError::Unsupported {
            operation: "start",
            host: handle.address.clone(),
        })
    }

    fn request_stop(&self, handle: &InstanceHandle) -> Result<(), Self::Error> {
        Err(StaticHostError::Unsupported {
            operation: "stop",
            host: handle.address.clone(),
        })
    }

    fn request_reboot(&self, _handle: &InstanceHandle) -> Result<RebootRequest, Self::Error> {
        Ok(RebootRequest::Guest)
    }

    fn request_delete(&self, _handle: &InstanceHandle) -> Result<(), Self::Error> {
        Ok(())
    }

    fn delete_policy(&self) -> PendingPolicy {
        PendingPolicy::Warn
    }
}
