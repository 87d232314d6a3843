//! Readiness state machine.
//!
//! Drives an instance from "start requested" to "first boot finished"
//! through strictly ordered phases. Each phase has its own budget and a
//! timeout names the phase that stalled, so a caller can tell whether the
//! guest never came up, never rebooted, or never finished configuring
//! itself.

mod boot_id;
mod first_boot;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::PowerState;
use crate::channel::{ChannelError, Connector, ExecutionChannel};
use crate::outcome::CommandOutcome;
use crate::retry::{Clock, PollError, PollPolicy, poll_until};

use first_boot::{Attempt, Deadline};

pub use boot_id::{BOOT_ID_COMMAND, BootId, BootIdError, get_boot_id};
pub use first_boot::fallback_script;

/// Linear readiness phases.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ReadinessPhase {
    /// Start or reboot has been requested.
    Requested,
    /// The provider reports the instance as running.
    PowerStateConfirmed,
    /// A shell answered with an acceptable boot identity.
    ShellReachable,
    /// The first-boot agent has finished.
    FirstBootComplete,
}

impl ReadinessPhase {
    /// Phase that directly follows this one, if any.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Requested => Some(Self::PowerStateConfirmed),
            Self::PowerStateConfirmed => Some(Self::ShellReachable),
            Self::ShellReachable => Some(Self::FirstBootComplete),
            Self::FirstBootComplete => None,
        }
    }
}

impl fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::PowerStateConfirmed => "power-state-confirmed",
            Self::ShellReachable => "shell-reachable",
            Self::FirstBootComplete => "first-boot-complete",
        })
    }
}

/// Budgets and poll spacing for every phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessSettings {
    /// Identity and first-boot budget for a fresh boot.
    pub boot_timeout: Duration,
    /// Power, identity and first-boot budget after a restart.
    pub restart_timeout: Duration,
    /// Power-state budget for a fresh boot.
    pub power_timeout: Duration,
    /// Pause between power-state probes.
    pub power_poll_interval: Duration,
    /// Pause between boot identity reads.
    pub identity_poll_interval: Duration,
    /// Maximum polls of `cloud-init.target`.
    pub first_boot_target_attempts: u32,
    /// Pause between `cloud-init.target` polls.
    pub first_boot_poll_interval: Duration,
    /// Treat a failed first-boot outcome as an error.
    pub fail_on_first_boot_error: bool,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(40 * 60),
            restart_timeout: Duration::from_secs(15 * 60),
            power_timeout: Duration::from_secs(20 * 60),
            power_poll_interval: Duration::from_secs(5),
            identity_poll_interval: Duration::from_secs(1),
            first_boot_target_attempts: 300,
            first_boot_poll_interval: Duration::from_secs(1),
            fail_on_first_boot_error: false,
        }
    }
}

/// Whether the machine waits for a first boot or for a reboot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootKind {
    /// Any readable identity will do.
    Fresh,
    /// The identity must differ from `previous`. Callers without a
    /// captured identity wait with [`BootKind::Fresh`] instead.
    Restart {
        /// Identity read before the reboot was requested.
        previous: Option<BootId>,
    },
}

impl BootKind {
    fn budget(&self, settings: &ReadinessSettings) -> Duration {
        match self {
            Self::Fresh => settings.boot_timeout,
            Self::Restart { .. } => settings.restart_timeout,
        }
    }

    fn power_budget(&self, settings: &ReadinessSettings) -> Duration {
        match self {
            Self::Fresh => settings.power_timeout,
            Self::Restart { .. } => settings.restart_timeout,
        }
    }

    fn previous(&self) -> Option<&BootId> {
        match self {
            Self::Fresh => None,
            Self::Restart { previous } => previous.as_ref(),
        }
    }
}

/// What a successful wait observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadinessReport {
    /// Identity of the boot the guest is now in.
    pub boot_id: BootId,
    /// Boot identity reads performed in the shell-reachable phase.
    pub identity_polls: u32,
    /// Outcome of the first-boot completion command.
    pub first_boot: CommandOutcome,
}

/// Failures of the readiness machine. `E` is the backend's error type.
#[derive(Debug, Error)]
pub enum ReadinessError<E>
where
    E: std::error::Error + 'static,
{
    /// A phase ran out of budget.
    #[error("timed out after {budget:?} waiting for phase {phase}; last failure: {last_failure}")]
    Timeout {
        /// Phase that stalled.
        phase: ReadinessPhase,
        /// Budget that was exhausted.
        budget: Duration,
        /// Last failure or state observed.
        last_failure: String,
    },
    /// The channel failed in a way polling cannot fix.
    #[error("channel failed during phase {phase}: {source}")]
    Channel {
        /// Phase in progress.
        phase: ReadinessPhase,
        /// Underlying failure.
        #[source]
        source: ChannelError,
    },
    /// The power-state probe failed.
    #[error("power-state probe failed: {0}")]
    PowerState(#[source] E),
    /// The provider reports the instance as gone.
    #[error("instance disappeared while waiting for it to run")]
    InstanceGone,
    /// The first-boot agent reported failure and the caller opted in to
    /// treating that as fatal.
    #[error("first-boot agent failed: {outcome}")]
    FirstBootFailed {
        /// Outcome of the completion command.
        outcome: CommandOutcome,
    },
    /// A phase was entered out of order.
    #[error("cannot move from phase {from} to {to}")]
    Transition {
        /// Current phase.
        from: ReadinessPhase,
        /// Requested phase.
        to: ReadinessPhase,
    },
}

#[derive(Debug, Error)]
enum PowerWait<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Probe(E),
    #[error("instance gone")]
    Gone,
}

#[derive(Debug, Error)]
#[error(transparent)]
struct IdentityAbort(ChannelError);

#[derive(Debug, Error)]
enum FirstBootStop {
    #[error(transparent)]
    Channel(ChannelError),
    #[error("{0}")]
    Expired(String),
}

/// One pass of the readiness phases.
pub struct ReadinessMachine {
    settings: ReadinessSettings,
    clock: Arc<dyn Clock>,
    phase: ReadinessPhase,
}

impl fmt::Debug for ReadinessMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessMachine")
            .field("settings", &self.settings)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl ReadinessMachine {
    /// Creates a machine in [`ReadinessPhase::Requested`].
    #[must_use]
    pub fn new(settings: ReadinessSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            phase: ReadinessPhase::Requested,
        }
    }

    /// Phase reached so far.
    #[must_use]
    pub const fn phase(&self) -> ReadinessPhase {
        self.phase
    }

    /// Moves to `next`, which must directly follow the current phase.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Transition`] for a backward move or one
    /// that skips a phase.
    pub fn advance<E>(&mut self, next: ReadinessPhase) -> Result<(), ReadinessError<E>>
    where
        E: std::error::Error + 'static,
    {
        if self.phase.successor() != Some(next) {
            return Err(ReadinessError::Transition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = %self.phase, to = %next, "readiness phase reached");
        self.phase = next;
        Ok(())
    }

    /// Runs every phase in order.
    ///
    /// `power_probe` reports the provider's view of the instance; returning
    /// `Ok(None)` skips the power phase.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError`] when a phase times out, the probe fails,
    /// or the channel fails in a way retries cannot fix.
    pub fn run<C, E, P>(
        &mut self,
        channel: &mut ExecutionChannel<C>,
        kind: &BootKind,
        power_probe: P,
    ) -> Result<ReadinessReport, ReadinessError<E>>
    where
        C: Connector,
        E: std::error::Error + 'static,
        P: FnMut() -> Result<Option<PowerState>, E>,
    {
        self.await_power(kind, power_probe)?;
        self.advance(ReadinessPhase::PowerStateConfirmed)?;

        let (boot_id, identity_polls) = self.await_identity(channel, kind)?;
        self.advance(ReadinessPhase::ShellReachable)?;

        let first_boot = self.await_first_boot(channel, kind)?;
        if first_boot.failed() && self.settings.fail_on_first_boot_error {
            return Err(ReadinessError::FirstBootFailed {
                outcome: first_boot,
            });
        }
        self.advance(ReadinessPhase::FirstBootComplete)?;

        info!(%boot_id, identity_polls, "instance ready");
        Ok(ReadinessReport {
            boot_id,
            identity_polls,
            first_boot,
        })
    }

    fn await_power<E, P>(&self, kind: &BootKind, mut probe: P) -> Result<(), ReadinessError<E>>
    where
        E: std::error::Error + 'static,
        P: FnMut() -> Result<Option<PowerState>, E>,
    {
        let budget = kind.power_budget(&self.settings);
        let policy = PollPolicy::new(budget, self.settings.power_poll_interval);
        let mut last = None;
        let result = poll_until(self.clock.as_ref(), policy, "power state running", || {
            let state = probe().map_err(PowerWait::Probe)?;
            last = state;
            match state {
                None | Some(PowerState::Running) => Ok(true),
                Some(PowerState::Gone) => Err(PowerWait::Gone),
                Some(_) => Ok(false),
            }
        });
        match result {
            Ok(_) => Ok(()),
            Err(PollError::Timeout { budget, .. }) => Err(ReadinessError::Timeout {
                phase: ReadinessPhase::PowerStateConfirmed,
                budget,
                last_failure: format!("power state {last:?}"),
            }),
            Err(PollError::Check(PowerWait::Probe(err))) => Err(ReadinessError::PowerState(err)),
            Err(PollError::Check(PowerWait::Gone)) => Err(ReadinessError::InstanceGone),
        }
    }

    fn await_identity<C, E>(
        &self,
        channel: &mut ExecutionChannel<C>,
        kind: &BootKind,
    ) -> Result<(BootId, u32), ReadinessError<E>>
    where
        C: Connector,
        E: std::error::Error + 'static,
    {
        let budget = kind.budget(&self.settings);
        let policy = PollPolicy::new(budget, self.settings.identity_poll_interval);
        let previous = kind.previous();
        let mut last_failure = String::from("no boot identity read");
        let mut current = None;

        let result = poll_until(self.clock.as_ref(), policy, "new boot identity", || {
            match get_boot_id(channel) {
                Ok(id) if previous == Some(&id) => {
                    last_failure = format!("boot id still {id}");
                    Ok(false)
                }
                Ok(id) => {
                    current = Some(id);
                    Ok(true)
                }
                Err(BootIdError::Channel(err)) if err.is_configuration() => {
                    Err(IdentityAbort(err))
                }
                Err(err) => {
                    debug!(error = %err, "boot id not readable yet");
                    last_failure = err.to_string();
                    Ok(false)
                }
            }
        });

        match (result, current) {
            (Ok(polls), Some(id)) => Ok((id, polls)),
            (Ok(_), None) | (Err(PollError::Timeout { .. }), _) => Err(ReadinessError::Timeout {
                phase: ReadinessPhase::ShellReachable,
                budget,
                last_failure,
            }),
            (Err(PollError::Check(IdentityAbort(source))), _) => Err(ReadinessError::Channel {
                phase: ReadinessPhase::ShellReachable,
                source,
            }),
        }
    }

    fn await_first_boot<C, E>(
        &self,
        channel: &mut ExecutionChannel<C>,
        kind: &BootKind,
    ) -> Result<CommandOutcome, ReadinessError<E>>
    where
        C: Connector,
        E: std::error::Error + 'static,
    {
        let clock = self.clock.as_ref();
        let budget = kind.budget(&self.settings);
        let deadline = Deadline::new(clock, budget);
        let policy = PollPolicy::new(budget, self.settings.first_boot_poll_interval);
        let mut last_failure = String::from("first-boot agent not queried");
        let mut finished = None;

        let result = poll_until(clock, policy, "first boot complete", || {
            match first_boot::attempt(channel, clock, &self.settings, deadline) {
                Ok(Attempt::Done(outcome)) => {
                    finished = Some(outcome);
                    Ok(true)
                }
                Ok(Attempt::Expired(message)) => Err(FirstBootStop::Expired(message)),
                Err(err) if err.is_unreachable() => {
                    debug!(error = %err, "first-boot check interrupted; retrying");
                    last_failure = err.to_string();
                    Ok(false)
                }
                Err(err) => Err(FirstBootStop::Channel(err)),
            }
        });

        match (result, finished) {
            (Ok(_), Some(outcome)) => Ok(outcome),
            (Err(PollError::Check(FirstBootStop::Expired(message))), _) => {
                Err(ReadinessError::Timeout {
                    phase: ReadinessPhase::FirstBootComplete,
                    budget,
                    last_failure: message,
                })
            }
            (Ok(_), None) | (Err(PollError::Timeout { .. }), _) => Err(ReadinessError::Timeout {
                phase: ReadinessPhase::FirstBootComplete,
                budget,
                last_failure,
            }),
            (Err(PollError::Check(FirstBootStop::Channel(source))), _) => {
                Err(ReadinessError::Channel {
                    phase: ReadinessPhase::FirstBootComplete,
                    source,
                })
            }
        }
    }
}
