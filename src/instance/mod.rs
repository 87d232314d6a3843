//! Instance lifecycle orchestration.
//!
//! [`Instance`] sequences backend requests with the readiness machine and
//! owns the execution channel to its guest. Once deleted an instance is
//! terminal: further deletes are no-ops and every other operation fails.

mod error;
mod files;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, debug, info, info_span, warn};

use crate::backend::{Backend, InstanceHandle, PendingPolicy, PowerState, RebootRequest};
use crate::channel::{ChannelSettings, Connector, Destination, ExecutionChannel};
use crate::key::KeyPair;
use crate::outcome::CommandOutcome;
use crate::readiness::{
    BootId, BootKind, ReadinessMachine, ReadinessReport, ReadinessSettings, get_boot_id,
};
use crate::retry::{Clock, PollError, PollPolicy, poll_until};
use crate::shell::RemoteCommand;

pub use error::InstanceError;

/// Budgets for stop and delete confirmation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// How long to wait for a stop to take effect.
    pub stop_timeout: Duration,
    /// How long to wait for a delete to take effect.
    pub delete_timeout: Duration,
    /// Pause between stop/delete checks.
    pub poll_interval: Duration,
    /// What to do when a stop is still pending after its budget.
    pub stop_policy: PendingPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10 * 60),
            delete_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
            stop_policy: PendingPolicy::Fail,
        }
    }
}

/// Everything an [`Instance`] needs besides its backend and connector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSettings {
    /// Login user on the guest.
    pub user: String,
    /// Connection retry settings.
    pub channel: ChannelSettings,
    /// Readiness budgets.
    pub readiness: ReadinessSettings,
    /// Stop and delete budgets.
    pub lifecycle: LifecycleSettings,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            user: String::from("ubuntu"),
            channel: ChannelSettings::default(),
            readiness: ReadinessSettings::default(),
            lifecycle: LifecycleSettings::default(),
        }
    }
}

/// A provider resource plus the channel to its guest.
pub struct Instance<B: Backend, C: Connector> {
    backend: B,
    handle: InstanceHandle,
    user: String,
    channel: ExecutionChannel<C>,
    readiness: ReadinessSettings,
    lifecycle: LifecycleSettings,
    clock: Arc<dyn Clock>,
    boot_id: Option<BootId>,
    power_state: Option<PowerState>,
    terminal: bool,
    tmp_count: u32,
    span: Span,
}

type Outcome<T, B> = Result<T, InstanceError<<B as Backend>::Error>>;

impl<B: Backend, C: Connector> Instance<B, C> {
    /// Wraps a provisioned resource. No connection is made yet.
    #[must_use]
    pub fn new(
        backend: B,
        handle: InstanceHandle,
        connector: C,
        key: Option<Arc<KeyPair>>,
        settings: InstanceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let destination = Destination::new(&settings.user, &handle.address, handle.ssh_port);
        let channel = ExecutionChannel::new(
            connector,
            destination,
            key,
            settings.channel,
            Arc::clone(&clock),
        );
        let span = info_span!("instance", id = %handle);
        Self {
            backend,
            handle,
            user: settings.user,
            channel,
            readiness: settings.readiness,
            lifecycle: settings.lifecycle,
            clock,
            boot_id: None,
            power_state: None,
            terminal: false,
            tmp_count: 0,
            span,
        }
    }

    /// Provider handle.
    #[must_use]
    pub const fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    /// Backend driving this instance.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Boot identity seen by the last successful wait or read.
    #[must_use]
    pub const fn cached_boot_id(&self) -> Option<&BootId> {
        self.boot_id.as_ref()
    }

    /// Power state seen by the last probe.
    #[must_use]
    pub const fn last_power_state(&self) -> Option<PowerState> {
        self.power_state
    }

    /// Returns `true` once the instance has been deleted.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn ensure_live(&self) -> Outcome<(), B> {
        if self.terminal {
            return Err(InstanceError::Terminal {
                id: self.handle.id.clone(),
            });
        }
        Ok(())
    }

    /// Runs a command on the guest. Non-zero exits are returned as data.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Terminal`] after delete and
    /// [`InstanceError::Channel`] when the guest cannot be reached.
    pub fn execute(
        &mut self,
        command: impl Into<RemoteCommand>,
        stdin: Option<&[u8]>,
    ) -> Outcome<CommandOutcome, B> {
        self.ensure_live()?;
        Ok(self.channel.execute(command, stdin)?)
    }

    /// Reads the guest's boot identity and caches it.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::BootId`] when the identity cannot be read.
    pub fn get_boot_id(&mut self) -> Outcome<BootId, B> {
        self.ensure_live()?;
        let id = get_boot_id(&mut self.channel)?;
        self.boot_id = Some(id.clone());
        Ok(id)
    }

    /// Waits for a freshly started instance to be fully ready.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Readiness`] when a phase fails.
    pub fn wait(&mut self) -> Outcome<ReadinessReport, B> {
        self.run_readiness(&BootKind::Fresh)
    }

    /// Waits for the guest to come back with a boot identity other than
    /// `previous`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Readiness`] when a phase fails.
    pub fn wait_for_restart(&mut self, previous: Option<BootId>) -> Outcome<ReadinessReport, B> {
        self.run_readiness(&BootKind::Restart { previous })
    }

    fn run_readiness(&mut self, kind: &BootKind) -> Outcome<ReadinessReport, B> {
        self.ensure_live()?;
        let _entered = self.span.clone().entered();
        let mut machine = ReadinessMachine::new(self.readiness, Arc::clone(&self.clock));
        let backend = &self.backend;
        let handle = &self.handle;
        let power_state = &mut self.power_state;
        let report = machine.run(&mut self.channel, kind, || {
            backend.power_state(handle).map(|state| {
                *power_state = state;
                state
            })
        })?;
        self.boot_id = Some(report.boot_id.clone());
        Ok(report)
    }

    /// Powers the instance on and optionally waits for readiness.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Backend`] when the provider rejects the
    /// request, or the readiness error when waiting fails.
    pub fn start(&mut self, wait: bool) -> Outcome<Option<ReadinessReport>, B> {
        self.ensure_live()?;
        let _entered = self.span.clone().entered();
        info!("starting instance");
        self.backend
            .request_start(&self.handle)
            .map_err(InstanceError::backend("start instance"))?;
        self.refresh_address()?;
        if wait { self.wait().map(Some) } else { Ok(None) }
    }

    fn refresh_address(&mut self) -> Outcome<(), B> {
        let address = self
            .backend
            .resolve_address(&self.handle)
            .map_err(InstanceError::backend("resolve address"))?;
        if address != self.handle.address {
            debug!(from = %self.handle.address, to = %address, "address changed");
            self.handle.address = address;
        }
        self.channel.retarget(Destination::new(
            &self.user,
            &self.handle.address,
            self.handle.ssh_port,
        ));
        Ok(())
    }

    /// Powers the instance off and optionally waits until it has stopped.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Backend`] when the provider fails and
    /// [`InstanceError::Pending`] when the stop does not complete in time
    /// under [`PendingPolicy::Fail`].
    pub fn shutdown(&mut self, wait: bool) -> Outcome<(), B> {
        self.ensure_live()?;
        let _entered = self.span.clone().entered();
        info!("shutting down instance");
        self.backend
            .request_stop(&self.handle)
            .map_err(InstanceError::backend("stop instance"))?;
        self.channel.disconnect();
        self.boot_id = None;
        if wait {
            let budget = self.lifecycle.stop_timeout;
            let backend = &self.backend;
            let handle = &self.handle;
            let result = poll_until(
                self.clock.as_ref(),
                PollPolicy::new(budget, self.lifecycle.poll_interval),
                "instance stopped",
                || backend.is_stopped(handle),
            );
            self.settle("stop", budget, self.lifecycle.stop_policy, result)?;
        }
        Ok(())
    }

    /// Reboots the instance, optionally waiting for the new boot.
    ///
    /// When waiting, the boot identity is captured first so the wait can
    /// insist on a different one. If it cannot be captured the wait falls
    /// back to a fresh-boot wait. The pre-reboot `sync` gets a single
    /// connection attempt so an unreachable guest does not delay the reboot.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Backend`] when the provider rejects the
    /// reboot, [`InstanceError::Channel`] when a guest-initiated reboot
    /// cannot reach the guest, or the readiness error when waiting fails.
    pub fn restart(&mut self, wait: bool) -> Outcome<Option<ReadinessReport>, B> {
        self.ensure_live()?;
        let _entered = self.span.clone().entered();
        let previous = if wait { self.capture_boot_id() } else { None };

        self.flush_filesystems();
        info!("restarting instance");
        let request = self
            .backend
            .request_reboot(&self.handle)
            .map_err(InstanceError::backend("reboot instance"))?;
        if request == RebootRequest::Guest {
            self.reboot_from_guest()?;
        }
        self.channel.disconnect();
        self.boot_id = None;

        if !wait {
            return Ok(None);
        }
        let report = match previous {
            Some(id) => self.wait_for_restart(Some(id))?,
            None => self.wait()?,
        };
        Ok(Some(report))
    }

    fn capture_boot_id(&mut self) -> Option<BootId> {
        match get_boot_id(&mut self.channel) {
            Ok(id) => {
                debug!(boot_id = %id, "captured boot id before restart");
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "could not capture boot id; waiting as for a fresh boot");
                None
            }
        }
    }

    fn flush_filesystems(&mut self) {
        match self.channel.execute_once("sync", None) {
            Ok(outcome) if outcome.failed() => {
                debug!(%outcome, "sync failed before restart");
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "sync skipped before restart"),
        }
    }

    fn reboot_from_guest(&mut self) -> Outcome<(), B> {
        let command = RemoteCommand::from(["shutdown", "-r", "now"]).sudo();
        match self.channel.execute(command, None) {
            Ok(_) => Ok(()),
            Err(err) if err.is_session_lost() => {
                debug!(error = %err, "session closed by reboot");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the instance. A no-op once the instance is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Backend`] when the provider rejects the
    /// request and [`InstanceError::Pending`] when the delete does not
    /// complete in time under [`PendingPolicy::Fail`].
    pub fn delete(&mut self, wait: bool) -> Outcome<(), B> {
        if self.terminal {
            debug!(id = %self.handle, "instance already deleted");
            return Ok(());
        }
        let _entered = self.span.clone().entered();
        info!("deleting instance");
        self.backend
            .request_delete(&self.handle)
            .map_err(InstanceError::backend("delete instance"))?;
        self.channel.disconnect();
        self.terminal = true;
        self.boot_id = None;

        if wait {
            let budget = self.lifecycle.delete_timeout;
            let backend = &self.backend;
            let handle = &self.handle;
            let result = poll_until(
                self.clock.as_ref(),
                PollPolicy::new(budget, self.lifecycle.poll_interval),
                "instance deleted",
                || backend.is_deleted(handle),
            );
            self.settle("delete", budget, self.backend.delete_policy(), result)?;
        }
        Ok(())
    }

    fn settle(
        &self,
        operation: &'static str,
        budget: Duration,
        policy: PendingPolicy,
        result: Result<u32, PollError<B::Error>>,
    ) -> Outcome<(), B> {
        match result {
            Ok(_) => Ok(()),
            Err(PollError::Check(source)) => Err(InstanceError::Backend {
                operation,
                source,
            }),
            Err(PollError::Timeout { .. }) => match policy {
                PendingPolicy::Fail => Err(InstanceError::Pending { operation, budget }),
                PendingPolicy::Warn => {
                    warn!(id = %self.handle, operation, ?budget, "still pending; continuing");
                    Ok(())
                }
            },
        }
    }
}

impl<B: Backend, C: Connector> fmt::Debug for Instance<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("boot_id", &self.boot_id)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
