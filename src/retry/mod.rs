//! Bounded retry with exponential or fixed backoff.
//!
//! Every loop that talks to a guest or a control plane goes through this
//! module so that retry counts, jitter, and total-time caps behave the same
//! everywhere. Time is read from an injected [`Clock`].

mod clock;
mod poll;

use std::fmt;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

pub use clock::{Clock, SystemClock};
pub use poll::{PollError, PollPolicy, poll_until};

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Spacing {
    /// `base_delay * 2^attempt`.
    Exponential,
    /// `base_delay` every time.
    Fixed,
}

/// Errors that expose a coarse kind so callers can choose which failures to
/// retry.
pub trait Classified {
    /// Discriminant compared against the retryable set.
    type Kind: Copy + Eq + fmt::Debug;

    /// Returns the kind of this failure.
    fn kind(&self) -> Self::Kind;
}

/// Retry policy. Stateless and reusable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on total elapsed time, sleeps included.
    pub max_time: Option<Duration>,
    /// Multiply each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
    /// Growth between attempts.
    pub spacing: Spacing,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(1))
    }
}

impl Backoff {
    /// Jittered exponential backoff without a total-time cap.
    #[must_use]
    pub const fn exponential(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_time: None,
            jitter: true,
            spacing: Spacing::Exponential,
        }
    }

    /// Evenly spaced attempts without jitter. `attempts` counts the first
    /// try.
    #[must_use]
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            retries: attempts.saturating_sub(1),
            base_delay: delay,
            max_time: None,
            jitter: false,
            spacing: Spacing::Fixed,
        }
    }

    /// Caps the total elapsed time.
    #[must_use]
    pub const fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1`, ignoring jitter and caps.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.spacing {
            Spacing::Fixed => self.base_delay,
            Spacing::Exponential => 2_u32
                .checked_pow(attempt)
                .map_or(Duration::MAX, |factor| self.base_delay.saturating_mul(factor)),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        rand::thread_rng().gen_range(half..=delay.saturating_add(half))
    }

    /// Runs `op`, retrying every failure.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] with the last failure once retries or
    /// the time cap run out.
    pub fn retry<T, E, F>(&self, clock: &dyn Clock, op: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.retry_if(clock, |_| true, op)
    }

    /// Runs `op`, retrying only failures whose kind is in `kinds`. An empty
    /// set retries every failure.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Aborted`] for a failure outside `kinds`, or
    /// [`RetryError::Exhausted`] once retries or the time cap run out.
    pub fn retry_on<T, E, F>(
        &self,
        clock: &dyn Clock,
        kinds: &[E::Kind],
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + Classified + 'static,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.retry_if(
            clock,
            |err: &E| kinds.is_empty() || kinds.contains(&err.kind()),
            op,
        )
    }

    /// Runs `op`, retrying failures accepted by `is_retryable`.
    ///
    /// `op` receives the zero-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Aborted`] for a rejected failure, or
    /// [`RetryError::Exhausted`] once retries or the time cap run out.
    pub fn retry_if<T, E, P, F>(
        &self,
        clock: &dyn Clock,
        mut is_retryable: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        P: FnMut(&E) -> bool,
        F: FnMut(u32) -> Result<T, E>,
    {
        let start = clock.now();
        let mut attempt = 0_u32;
        loop {
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !is_retryable(&err) {
                return Err(RetryError::Aborted(err));
            }

            let elapsed = clock.elapsed_since(start);
            let exhausted = |source| RetryError::Exhausted {
                attempts: attempt.saturating_add(1),
                elapsed,
                source,
            };
            if attempt >= self.retries {
                return Err(exhausted(err));
            }

            let mut delay = self.jittered(self.delay_for(attempt));
            if let Some(max_time) = self.max_time {
                let remaining = max_time.saturating_sub(elapsed);
                if remaining.is_zero() {
                    return Err(exhausted(err));
                }
                delay = delay.min(remaining);
            }

            warn!(
                attempt = attempt.saturating_add(1),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "attempt failed; retrying"
            );
            clock.sleep(delay);
            attempt = attempt.saturating_add(1);
        }
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Retries or the time cap ran out. Carries the last failure.
    #[error("gave up after {attempts} attempts in {elapsed:?}: {source}")]
    Exhausted {
        /// Attempts made, the first included.
        attempts: u32,
        /// Time spent, sleeps included.
        elapsed: Duration,
        /// Last failure observed.
        #[source]
        source: E,
    },
    /// A failure outside the retryable set stopped the loop.
    #[error(transparent)]
    Aborted(E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns the last failure observed.
    #[must_use]
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Aborted(err) => err,
        }
    }
}
