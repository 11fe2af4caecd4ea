//! Retry policy with exponential backoff, cap, and jitter.

use std::time::Duration;

use rand::Rng;

/// Retry behavior for one direction of step execution.
///
/// Forward steps and compensations each get their own policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Delay before the first retry (before jitter).
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Delay cap (before jitter).
    pub max_delay: Duration,
    /// Delay is multiplied by a random factor in [1-jitter, 1+jitter].
    pub jitter: f64,
    /// Upper bound for one remote call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Default policy for compensations: more patient than forward steps,
    /// since a compensation that gives up leaves the saga FAILED.
    pub fn for_compensation() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// A policy that retries without waiting, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Check if another retry should be made after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Delay before retry number `retry` (0-indexed).
    ///
    /// `base * multiplier^retry`, capped at `max_delay`, then jittered.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponential_ms = base_ms * self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as f64);

        let jittered_ms = if self.jitter > 0.0 && capped_ms > 0.0 {
            let jitter = self.jitter.min(1.0);
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            capped_ms * factor
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms.round() as u64)
    }
}
