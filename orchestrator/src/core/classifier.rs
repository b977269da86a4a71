//! Failure taxonomy and deterministic classification.
//!
//! `Failure` values carry curated summaries only. Raw exit codes and captured
//! process output stay in the per-attempt log files.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Retry category of a raised failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// May succeed on a later attempt.
    Transient,
    /// Will not improve on blind retry.
    Permanent,
}

/// A failure raised while executing, reviewing, or testing a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("network failure during {0}")]
    Network(String),
    #[error("rate limited during {0}")]
    RateLimited(String),
    #[error("{phase} timed out after {}s", .after.as_secs())]
    Timeout { phase: String, after: Duration },
    #[error("resources exhausted during {0}")]
    ResourceExhausted(String),
    #[error("{phase} failed without a recognizable cause")]
    Unrecognized { phase: String },
    #[error("{0} produced an unreadable reply")]
    MalformedReply(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("security rejection: {0}")]
    SecurityRejected(String),
    #[error("task cannot be carried out as described: {0}")]
    MalformedTask(String),
    #[error("cancelled")]
    Cancelled,
}

/// Map a failure to its retry category.
pub fn classify(failure: &Failure) -> FailureKind {
    match failure {
        Failure::Network(_)
        | Failure::RateLimited(_)
        | Failure::Timeout { .. }
        | Failure::ResourceExhausted(_)
        | Failure::Unrecognized { .. }
        | Failure::MalformedReply(_)
        | Failure::Cancelled => FailureKind::Transient,
        Failure::Validation(_) | Failure::SecurityRejected(_) | Failure::MalformedTask(_) => {
            FailureKind::Permanent
        }
    }
}

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded|quota exceeded")
        .expect("rate limit regex")
});
static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection (refused|reset|closed)|network is unreachable|econnreset|econnrefused|etimedout|dns|temporary failure in name resolution|\b50[234]\b",
    )
    .expect("network regex")
});
static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)out of memory|cannot allocate memory|enomem|no space left on device|resource temporarily unavailable|too many open files")
        .expect("resource regex")
});
static SECURITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission denied by policy|blocked by (security|safety) policy|refus(ed|e) to (run|execute)")
        .expect("security regex")
});

/// Derive a failure from an unsuccessful process run.
///
/// Only `diagnostics` is inspected; none of it is copied into the result.
pub fn failure_from_diagnostics(phase: &str, diagnostics: &str) -> Failure {
    let phase = phase.to_string();
    if RATE_LIMIT_RE.is_match(diagnostics) {
        Failure::RateLimited(phase)
    } else if RESOURCE_RE.is_match(diagnostics) {
        Failure::ResourceExhausted(phase)
    } else if SECURITY_RE.is_match(diagnostics) {
        Failure::SecurityRejected(format!("{phase} was refused by policy"))
    } else if NETWORK_RE.is_match(diagnostics) {
        Failure::Network(phase)
    } else {
        Failure::Unrecognized { phase }
    }
}
