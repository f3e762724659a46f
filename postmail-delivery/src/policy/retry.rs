//! Retry policy for transient delivery failures.
//!
//! The policy is pure: given the retry count already recorded on an email it
//! decides whether another attempt is allowed and how long to wait for it.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// What to do with an email after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue the email again, visible after `delay`.
    Reschedule { retry_count: u32, delay: Duration },
    /// Retries are used up; the email fails.
    Exhausted { retry_count: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds.
    ///
    /// Retry `n` waits `base * 2^n`.
    ///
    /// Default: 10000
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay, in milliseconds.
    ///
    /// Default: 86400000 (24 hours)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomises each delay within ±`jitter_factor`.
    ///
    /// Default: 0.0
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Decide the follow-up for an email whose recorded retry count is
    /// `previous`.
    #[must_use]
    pub fn decide(&self, previous: u32) -> RetryDecision {
        let retry_count = previous.saturating_add(1);

        if retry_count > self.max_retries {
            RetryDecision::Exhausted { retry_count }
        } else {
            RetryDecision::Reschedule {
                retry_count,
                delay: self.backoff(retry_count),
            }
        }
    }

    /// Delay before retry number `retry_count`: `base * 2^retry_count`,
    /// capped at `max_delay_ms`, then jittered.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let delay = if retry_count >= 63 {
            self.max_delay_ms
        } else {
            self.base_delay_ms
                .saturating_mul(1u64 << retry_count)
                .min(self.max_delay_ms)
        };

        Duration::from_millis(self.jitter(delay))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn jitter(&self, delay: u64) -> u64 {
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        let range = (delay as f64) * self.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        ((delay as f64) + jitter).max(0.0) as u64
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        10_000
    }

    pub const fn max_delay_ms() -> u64 {
        86_400_000
    }
}
