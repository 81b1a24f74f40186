//! Retry and backoff policy for the send dispatcher and reaper (spec §4.3).
//!
//! `backoff(attempt) = base * 2^(attempt-1) * (1 + U(-jitter, +jitter))`,
//! clamped to `ceiling`. Some error classes start at a different base
//! delay, and some are terminal on the first occurrence regardless of
//! `max_attempts`.
//!
//! # Example
//!
//! ```
//! use sendgate_retry::{RetryPolicy, next_attempt};
//! use sendgate_types::ErrorCode;
//!
//! let policy = RetryPolicy::default();
//! let decision = next_attempt(&policy, ErrorCode::Gmail5xx, 1);
//! assert!(!decision.terminal);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sendgate_types::ErrorCode;

/// Retry policy defaults from spec §4.3: base 60s, ceiling 3600s, jitter
/// 0.2, max 8 attempts. `gmail_429` gets a longer base delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub ceiling: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub gmail_429_base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            ceiling: Duration::from_secs(3600),
            jitter: 0.2,
            max_attempts: 8,
            gmail_429_base_delay: Duration::from_secs(300),
        }
    }
}

/// Result of evaluating the retry policy for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Delay before the job becomes eligible again. Meaningless when `terminal`.
    pub backoff: Duration,
    /// True when the job should move straight to a terminal status instead
    /// of being requeued — either because the error class never retries,
    /// or because `attempt` has exhausted `max_attempts`.
    pub terminal: bool,
}

impl RetryDecision {
    fn unit(d: Duration) -> RetryDecision {
        RetryDecision { backoff: d, terminal: false }
    }

    fn stop() -> RetryDecision {
        RetryDecision { backoff: Duration::ZERO, terminal: true }
    }
}

/// Base delay to use for `attempt` 1 of this error class, before doubling.
fn base_delay_for(policy: &RetryPolicy, error: ErrorCode) -> Duration {
    match error {
        ErrorCode::Gmail429 => policy.gmail_429_base_delay,
        _ => policy.base_delay,
    }
}

/// Pure exponential-backoff-with-jitter calculation, independent of error
/// classification. `attempt` is 1-indexed, matching the dispatcher's
/// post-increment attempt counter.
pub fn calculate_backoff(base: Duration, ceiling: Duration, jitter: f64, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let doubled = base.saturating_mul(2_u32.saturating_pow(pow));
    let capped = doubled.min(ceiling);

    if jitter <= 0.0 {
        return capped;
    }

    use rand::Rng;
    let mut rng = rand::thread_rng();
    let span = 2.0 * jitter;
    let random_value: f64 = rng.r#gen();
    let factor = 1.0 - jitter + (random_value * span);
    let millis = (capped.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Decide whether attempt `attempt` (the count *after* this failure is
/// recorded) should retry, and with what backoff, given the error class
/// that caused the failure.
///
/// Error classes that are terminal on first occurrence (`gmail_400`,
/// `auth`, `policy`, `gate`, `not_found`) never retry, independent of
/// `max_attempts`.
pub fn next_attempt(policy: &RetryPolicy, error: ErrorCode, attempt: u32) -> RetryDecision {
    if error.is_terminal_on_first_occurrence() {
        return RetryDecision::stop();
    }

    if attempt >= policy.max_attempts {
        return RetryDecision::stop();
    }

    let base = base_delay_for(policy, error);
    RetryDecision::unit(calculate_backoff(base, policy.ceiling, policy.jitter, attempt))
}
