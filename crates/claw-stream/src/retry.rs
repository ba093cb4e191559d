//! Reconnection backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.8;

/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.2;

/// Largest exponent used when growing the delay; the cap applies long before.
const MAX_EXPONENT: u32 = 32;

/// Backoff configuration for stream reconnection.
///
/// `delay(attempt) = min(base_delay * 2^attempt * jitter, max_delay)` with
/// `jitter` drawn uniformly from `[0.8, 1.2]` on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries allowed before giving up.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given bounds.
    #[must_use]
    pub const fn new(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
        }
    }

    /// The base delay as a [`Duration`].
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// The delay cap as a [`Duration`].
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay for the given zero-based attempt, with fresh random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay for the given zero-based attempt with an explicit jitter factor.
    ///
    /// `jitter` is clamped into `[0.8, 1.2]`.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let growth = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let millis = (self.base_delay_ms as f64 * growth * jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.round() as u64)
    }

    /// Whether another retry is allowed after `attempt` retries.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Retry bookkeeping owned by one connection driver.
///
/// `attempt` only grows while failures accumulate and goes back to zero
/// when a frame is received, not when a connection merely opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    backoff: Duration,
    base: Duration,
}

impl RetryState {
    /// Fresh state for the given policy.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            backoff: policy.base_delay(),
            base: policy.base_delay(),
        }
    }

    /// Retries scheduled since the last received frame.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The most recently scheduled delay, or the base delay after a reset.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Record a transient failure.
    ///
    /// Returns the delay to wait before reconnecting, or `None` once the
    /// retry budget is spent.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if !policy.should_retry(self.attempt) {
            return None;
        }
        let delay = policy.delay(self.attempt);
        self.attempt += 1;
        self.backoff = delay;
        Some(delay)
    }

    /// Reset after a received frame.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.backoff = self.base;
    }
}
