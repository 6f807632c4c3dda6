//! Retry decisions and backoff delays for step attempts.
//!
//! Stateless: every decision is a pure function of the step's policy, the
//! attempt number and the error, so the step runner owns all run state.

use std::time::Duration;

use dagent_types::error::StepError;
use dagent_types::workflow::{Backoff, RetryPolicy};

/// Stateless retry handler for step attempts.
pub struct RetryHandler;

impl RetryHandler {
    /// Total attempts a step may make. No policy means a single attempt.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map_or(1, |p| p.max_attempts.max(1))
    }

    /// Whether attempt `attempt` (1-based) failing with `error` earns another try.
    ///
    /// Only retryable errors qualify; structural failures and permanent
    /// agent errors end the step immediately.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32, error: &StepError) -> bool {
        error.is_retryable() && attempt < Self::max_attempts(policy)
    }

    /// How long to wait after attempt `attempt` (1-based) fails.
    pub fn backoff_delay(policy: Option<&RetryPolicy>, attempt: u32) -> Duration {
        let Some(policy) = policy else {
            return Duration::ZERO;
        };
        match policy.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential {
                base_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let delay = base_delay_ms as f64 * multiplier.max(1.0).powi(exponent);
                let capped = delay.min(max_delay_ms as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}
