//! Retry scheduling and dead-letter routing policy.
//!
//! Two backoff shapes are used: the publisher retries confirms with full
//! jitter (`rand(0, min(cap, base * 2^(n-1)))`), task re-dispatch uses
//! equalized jitter (`min(cap, base * 2^(n-1)) * rand(0.5, 1.5)`).

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorClass;
use crate::routing::KindPolicy;

/// What the worker does with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch after the delay.
    Retry { delay: Duration },
    /// Route to the kind's dead-letter queue.
    DeadLetter,
    /// Ack without retry or DLQ (cancellations, timeouts).
    Drop,
}

/// Equalized-jitter delay for task retry number `attempt` (1-based).
pub fn retry_delay(attempt: i32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32) as u32;
    let ceiling = base_ms.saturating_mul(1_u64 << exp.min(20)).min(cap_ms);
    let factor: f64 = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((ceiling as f64 * factor) as u64)
}

/// Full-jitter delay for publish confirm retries.
pub fn publish_backoff(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ceiling = base_ms.saturating_mul(1_u64 << exp).min(cap_ms).max(1);
    let millis = rand::rng().random_range(0..=ceiling);
    Duration::from_millis(millis)
}

/// Apply the routing policy to a classified failure.
///
/// `attempts` is the number of executions so far (the attempt that just
/// failed included).
pub fn decide(class: ErrorClass, attempts: i32, policy: &KindPolicy) -> RetryDecision {
    match class {
        ErrorClass::Transient | ErrorClass::Deterministic { retryable: true } => {
            if attempts < policy.max_retries {
                RetryDecision::Retry {
                    delay: retry_delay(attempts, policy.base_backoff_ms, policy.cap_backoff_ms),
                }
            } else {
                RetryDecision::DeadLetter
            }
        }
        ErrorClass::User | ErrorClass::Fatal | ErrorClass::Deterministic { retryable: false } => {
            RetryDecision::DeadLetter
        }
        ErrorClass::Cancelled | ErrorClass::Timeout => RetryDecision::Drop,
    }
}
