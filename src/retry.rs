//! Backoff configuration carried by queued actions.
//!
//! The scheduler itself never interprets a retry policy; it stores the
//! fields on the action record so the worker that picks the action up can
//! space its attempts. The delay math lives here so every worker shares one
//! implementation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Validation failures raised when constructing a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("backoff_seconds must be greater than zero")]
    ZeroBackoff,
    #[error("backoff_factor must be at least 1.0, got {0}")]
    FactorBelowOne(f64),
    #[error("jitter must not be negative, got {0}")]
    NegativeJitter(f64),
}

/// Immutable backoff configuration attached to a queued action.
///
/// `jitter` is the fraction of each delay that is randomly added or
/// subtracted; `0.0` disables it. `max_attempts` of `None` retries
/// indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff_seconds: u32,
    backoff_factor: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(backoff_seconds: u32, backoff_factor: f64, jitter: f64) -> Result<Self, RetryPolicyError> {
        if backoff_seconds == 0 {
            return Err(RetryPolicyError::ZeroBackoff);
        }
        if backoff_factor < 1.0 {
            return Err(RetryPolicyError::FactorBelowOne(backoff_factor));
        }
        if jitter < 0.0 {
            return Err(RetryPolicyError::NegativeJitter(jitter));
        }
        Ok(Self {
            max_attempts: None,
            backoff_seconds,
            backoff_factor,
            jitter,
        })
    }

    /// Cap the number of attempts before the worker gives up.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn backoff_seconds(&self) -> u32 {
        self.backoff_seconds
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay to wait before retrying after the given zero-based attempt.
    ///
    /// Exponential backoff with the configured factor, adjusted by a random
    /// jitter in `[-jitter, +jitter]` of the delay. Never negative.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = f64::from(self.backoff_seconds) * self.backoff_factor.powi(attempt as i32);
        let jitter_delta = if self.jitter > 0.0 {
            // rand in [-1, 1)
            base * self.jitter * (rand::rng().random::<f64>() * 2.0 - 1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter_delta).max(0.0))
    }
}

impl Default for RetryPolicy {
    /// One second initial backoff, doubling, 10% jitter, unlimited attempts.
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_seconds: 1,
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_fields_on_construction() {
        assert_eq!(RetryPolicy::new(0, 2.0, 0.1), Err(RetryPolicyError::ZeroBackoff));
        assert_eq!(
            RetryPolicy::new(1, 0.5, 0.1),
            Err(RetryPolicyError::FactorBelowOne(0.5))
        );
        assert_eq!(
            RetryPolicy::new(1, 2.0, -0.2),
            Err(RetryPolicyError::NegativeJitter(-0.2))
        );
        assert!(RetryPolicy::new(1, 1.0, 0.0).is_ok());
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy::new(2, 3.0, 0.0).unwrap();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(18));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::new(10, 1.0, 0.5).unwrap();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0).as_secs_f64();
            assert!((5.0..=15.0).contains(&delay), "delay out of bounds: {delay}");
        }
    }

    #[test]
    fn max_attempts_is_optional() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), None);
        assert_eq!(policy.with_max_attempts(3).max_attempts(), Some(3));
    }
}
