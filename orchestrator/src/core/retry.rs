//! Retry policy as an explicit transition table.
//!
//! `Failed` x cause x attempts-remaining -> next state. No I/O, no sleeping:
//! the scheduler turns a `Retry` delay into a not-before instant.

use std::time::Duration;

use crate::core::classifier::FailureKind;

/// Verification rejections a task may accumulate. The rejection that reaches
/// this count blocks the task, so a task gets one fix re-invocation.
pub const MAX_FIX_ATTEMPTS: u32 = 2;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of times a task may enter `Running`.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `completed_attempts + 1`: `base * 2^(completed_attempts - 1)`, capped.
    pub fn backoff(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Why the latest attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// A raised failure, already classified.
    Raised(FailureKind),
    /// Review rejection or quality-gate regression.
    Rejected,
}

/// Decision taken from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Move to `Retrying`; run again after `delay`.
    Retry { delay: Duration },
    /// Move to `Blocked`.
    Block(BlockReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Permanent,
    AttemptsExhausted,
    FixAttemptsExhausted,
}

/// Decide the next state for a task sitting in `Failed`.
///
/// `attempts` is the number of executions so far (including the failed one);
/// `fix_attempts` the number of verification rejections (including this one).
pub fn decide(
    cause: FailureCause,
    attempts: u32,
    fix_attempts: u32,
    policy: &RetryPolicy,
) -> RetryDecision {
    match cause {
        FailureCause::Raised(FailureKind::Permanent) => RetryDecision::Block(BlockReason::Permanent),
        FailureCause::Raised(FailureKind::Transient) => {
            if attempts >= policy.max_attempts {
                RetryDecision::Block(BlockReason::AttemptsExhausted)
            } else {
                RetryDecision::Retry {
                    delay: policy.backoff(attempts),
                }
            }
        }
        FailureCause::Rejected => {
            if fix_attempts >= MAX_FIX_ATTEMPTS {
                RetryDecision::Block(BlockReason::FixAttemptsExhausted)
            } else {
                RetryDecision::Retry {
                    delay: Duration::ZERO,
                }
            }
        }
    }
}
