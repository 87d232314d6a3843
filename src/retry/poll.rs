//! Fixed-interval "wait until" loops.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::Clock;

/// Budget and spacing for a bounded poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Total time allowed before giving up.
    pub timeout: Duration,
    /// Pause between checks.
    pub interval: Duration,
}

impl PollPolicy {
    /// Creates a policy from a budget and an interval.
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Errors raised by [`poll_until`].
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// The predicate never held within the budget.
    #[error("timed out after {budget:?} waiting for {what} ({attempts} checks)")]
    Timeout {
        /// Description of the awaited state.
        what: String,
        /// Budget that was exhausted.
        budget: Duration,
        /// Number of checks performed.
        attempts: u32,
    },
    /// The check itself failed.
    #[error(transparent)]
    Check(E),
}

/// Calls `check` every `policy.interval` until it returns `Ok(true)`.
///
/// The check always runs at least once. Returns the number of checks
/// performed.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] when the budget runs out, or
/// [`PollError::Check`] as soon as `check` fails.
pub fn poll_until<E, F>(
    clock: &dyn Clock,
    policy: PollPolicy,
    what: &str,
    mut check: F,
) -> Result<u32, PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Result<bool, E>,
{
    let start = clock.now();
    let mut attempts = 0_u32;
    loop {
        attempts = attempts.saturating_add(1);
        if check().map_err(PollError::Check)? {
            debug!(what, attempts, "condition reached");
            return Ok(attempts);
        }

        let remaining = policy.timeout.saturating_sub(clock.elapsed_since(start));
        if remaining.is_zero() {
            return Err(PollError::Timeout {
                what: what.to_owned(),
                budget: policy.timeout,
                attempts,
            });
        }
        clock.sleep(policy.interval.min(remaining));
    }
}
