//! Restart decision policy: bounded attempts, exponential backoff.
//!
//! Pure and deterministic — identical attempt ordinals always produce
//! identical delays, so crash-recovery tests are reproducible. No jitter.

use std::time::Duration;

use crate::config::RestartConfig;

/// Outcome of consulting the policy for one crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Re-create the worker after waiting out the backoff delay.
    Retry {
        /// Delay to observe before the attempt.
        delay: Duration,
    },
    /// Attempts exhausted; fail the session.
    GiveUp,
}

/// Bounded exponential-backoff restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
    max_delay: Duration,
}

impl RestartPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Maximum attempts before giving up.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether restart attempt `attempt` (1-based) should proceed.
    ///
    /// Retries while `attempt <= max_attempts`, with
    /// `delay = base * multiplier^(attempt - 1)` capped at `max_delay`.
    /// Attempt ordinal 0 is treated as give-up: no crash has ordinal 0.
    #[must_use]
    pub fn decide(&self, attempt: u32) -> RestartDecision {
        if attempt == 0 || attempt > self.max_attempts {
            return RestartDecision::GiveUp;
        }

        let factor = u64::from(self.multiplier).saturating_pow(attempt - 1);
        let delay = self
            .base_delay
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .min(self.max_delay);

        RestartDecision::Retry { delay }
    }
}
