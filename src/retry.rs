//! Retry state machine and backoff schedule for transient failures.

use std::time::Duration;

use rand::Rng;

use crate::{config::RetryPolicy, deadline::Deadline};

/// Where an operation stands in its retry cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (1-based) is in flight.
    Attempting(u32),
    /// Attempt `n` failed transiently; waiting before attempt `n + 1`.
    BackingOff(u32),
    /// Attempt `n` failed and no further attempt is allowed.
    Exhausted(u32),
    /// Attempt `n` succeeded.
    Succeeded(u32),
}

impl RetryState {
    pub fn start() -> Self {
        RetryState::Attempting(1)
    }

    /// Attempts made so far, counting the one in flight.
    pub fn attempts(self) -> u32 {
        match self {
            RetryState::Attempting(n)
            | RetryState::BackingOff(n)
            | RetryState::Exhausted(n)
            | RetryState::Succeeded(n) => n,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RetryState::Exhausted(_) | RetryState::Succeeded(_))
    }

    pub fn on_success(self) -> Self {
        match self {
            RetryState::Attempting(n) => RetryState::Succeeded(n),
            other => other,
        }
    }

    /// Transition after a failed attempt. Only transient failures with
    /// attempts remaining lead to `BackingOff`.
    pub fn on_failure(self, retryable: bool, policy: &RetryPolicy) -> Self {
        match self {
            RetryState::Attempting(n) if retryable && n < policy.max_attempts => {
                RetryState::BackingOff(n)
            }
            RetryState::Attempting(n) => RetryState::Exhausted(n),
            other => other,
        }
    }

    pub fn on_backoff_elapsed(self) -> Self {
        match self {
            RetryState::BackingOff(n) => RetryState::Attempting(n + 1),
            other => other,
        }
    }
}

/// Delay before the attempt following failed attempt `attempt` (1-based), without jitter.
pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let scaled = policy.initial_backoff.as_secs_f64() * policy.multiplier.powi(exponent);
    let capped = scaled.min(policy.max_backoff.as_secs_f64());
    if capped.is_finite() && capped > 0.0 {
        Duration::from_secs_f64(capped)
    } else {
        Duration::ZERO
    }
}

/// Jittered delay, shortened so it never sleeps past `deadline`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, deadline: Deadline) -> Duration {
    let base = base_delay(policy, attempt);
    let delay = if policy.jitter > 0.0 && !base.is_zero() {
        let factor = rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
        base.mul_f64((1.0 + factor).max(0.0))
    } else {
        base
    };
    match deadline.remaining() {
        Some(left) => delay.min(left),
        None => delay,
    }
}
