//! Waiting for the first-boot agent (cloud-init) to finish.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{ChannelError, Connector, ExecutionChannel};
use crate::outcome::CommandOutcome;
use crate::retry::Clock;
use crate::shell::RemoteCommand;

use super::ReadinessSettings;

const HAS_SYSTEMD: &str = "command -v systemctl";
const TARGET_ACTIVE: [&str; 3] = ["systemctl", "is-active", "cloud-init.target"];
const STATUS_HELP: [&str; 3] = ["cloud-init", "status", "--help"];
const STATUS_WAIT: [&str; 4] = ["cloud-init", "status", "--wait", "--long"];
const SYSTEM_RUNNING_TEST: &str = "[ \"$(systemctl is-system-running)\" = 'running' -o \"$(systemctl is-system-running)\" = 'degraded' ]";
const RESULT_FILE_TEST: &str = "[ -f '/run/cloud-init/result.json' ]";

/// Exit status of `timeout(1)` when the wrapped command overran.
const GUEST_TIMEOUT_EXIT: i32 = 124;

/// Guest-side loop used when `cloud-init status --wait` is unavailable.
#[must_use]
pub fn fallback_script(seconds: u64, systemd: bool) -> String {
    let tests = if systemd {
        format!("{SYSTEM_RUNNING_TEST} && {RESULT_FILE_TEST}")
    } else {
        RESULT_FILE_TEST.to_owned()
    };
    format!(
        "i=0; while [ $i -lt {seconds} ] && i=$(($i+1)); do {tests} && exit 0; sleep 1; done; exit 1"
    )
}

/// Start and length of the first-boot phase.
#[derive(Clone, Copy, Debug)]
pub(super) struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub(super) fn new(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            start: clock.now(),
            budget,
        }
    }

    fn remaining(self, clock: &dyn Clock) -> Duration {
        self.budget.saturating_sub(clock.elapsed_since(self.start))
    }
}

/// Result of one pass through the completion sequence.
#[derive(Debug)]
pub(super) enum Attempt {
    /// The agent finished; its outcome may still be a failure.
    Done(CommandOutcome),
    /// The phase budget ran out before the agent finished.
    Expired(String),
}

/// Runs the first-boot completion sequence once.
///
/// Guest-side waits are bounded by what is left of `deadline`, so a hung
/// agent cannot stall the caller past the phase budget.
pub(super) fn attempt<C: Connector>(
    channel: &mut ExecutionChannel<C>,
    clock: &dyn Clock,
    settings: &ReadinessSettings,
    deadline: Deadline,
) -> Result<Attempt, ChannelError> {
    let systemd = channel.execute(HAS_SYSTEMD, None)?.ok();
    if systemd {
        await_target(channel, clock, settings, deadline)?;
    }

    let seconds = deadline.remaining(clock).as_secs();
    if seconds == 0 {
        return Ok(Attempt::Expired(String::from(
            "budget spent before cloud-init status could be queried",
        )));
    }

    let help = channel.execute(STATUS_HELP, None)?;
    let outcome = if help.stdout.contains("--wait") {
        let limit = seconds.to_string();
        let command =
            RemoteCommand::argv(["timeout", limit.as_str()].into_iter().chain(STATUS_WAIT));
        let outcome = channel.execute(command, None)?;
        if outcome.exit_code == GUEST_TIMEOUT_EXIT {
            return Ok(Attempt::Expired(format!(
                "cloud-init status --wait still running after {seconds}s"
            )));
        }
        outcome
    } else {
        info!("cloud-init lacks `status --wait`; polling for result.json");
        channel.execute(fallback_script(seconds, systemd), None)?
    };

    if outcome.failed() {
        warn!(
            exit_code = outcome.exit_code,
            stdout = %outcome.stdout,
            stderr = %outcome.stderr,
            "first-boot agent reported failure"
        );
    }
    Ok(Attempt::Done(outcome))
}

fn await_target<C: Connector>(
    channel: &mut ExecutionChannel<C>,
    clock: &dyn Clock,
    settings: &ReadinessSettings,
    deadline: Deadline,
) -> Result<(), ChannelError> {
    for attempt in 1..=settings.first_boot_target_attempts {
        if channel.execute(TARGET_ACTIVE, None)?.ok() {
            debug!(attempt, "cloud-init.target active");
            return Ok(());
        }
        let remaining = deadline.remaining(clock);
        if attempt == settings.first_boot_target_attempts || remaining.is_zero() {
            break;
        }
        clock.sleep(settings.first_boot_poll_interval.min(remaining));
    }
    warn!(
        attempts = settings.first_boot_target_attempts,
        "cloud-init.target never became active; continuing"
    );
    Ok(())
}
