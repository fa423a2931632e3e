//! Retry decisions for failed step attempts.
//!
//! [`decide`] turns a failed [`StepOutcome`] and its attempt number into
//! either a backoff delay or a decision to give up. Delays grow
//! exponentially from `base_delay` and are capped at `max_delay`; with jitter
//! enabled the delay is drawn from `[0, computed]` plus [`JITTER_FLOOR`].

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;
use crate::step::{StepOutcome, StepStatus};

/// Added to every jittered delay so a retry never fires immediately.
pub const JITTER_FLOOR: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Growth factor between consecutive delays. Values below 1.0 are
    /// treated as 1.0 so delays never shrink.
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Error kinds that end the workflow even though they are transient.
    pub fatal_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5 * 60),
            jitter: true,
            fatal_kinds: BTreeSet::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            jitter: false,
            ..Self::default()
        }
    }

    /// Delay before the attempt that follows `attempt`, without jitter:
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        // NaN (0 * inf) and inf both fall back to the cap.
        let capped = if secs.is_finite() {
            secs.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(capped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// `exhausted` is set when a retryable failure hit `max_attempts`.
    GiveUp { exhausted: bool },
}

pub fn decide(policy: &RetryPolicy, outcome: &StepOutcome, attempt: u32) -> RetryDecision {
    match outcome.status {
        StepStatus::Success | StepStatus::FatalFailure => RetryDecision::GiveUp { exhausted: false },
        StepStatus::RetryableFailure => {
            let escalated = outcome
                .error
                .as_ref()
                .is_some_and(|e| policy.fatal_kinds.contains(&e.kind));
            if escalated {
                return RetryDecision::GiveUp { exhausted: false };
            }
            if attempt >= policy.max_attempts {
                return RetryDecision::GiveUp { exhausted: true };
            }
            let backoff = policy.backoff(attempt);
            let delay = if policy.jitter { jittered(backoff) } else { backoff };
            // A server-requested wait is a floor, bounded by the policy cap.
            let floor = outcome
                .error
                .as_ref()
                .and_then(|e| e.retry_after)
                .map_or(Duration::ZERO, |wait| wait.min(policy.max_delay));
            RetryDecision::Retry(delay.max(floor))
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let ceiling = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let drawn = rand::rng().random_range(0..=ceiling);
    Duration::from_millis(drawn) + JITTER_FLOOR
}
