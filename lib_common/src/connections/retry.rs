//! # Retry With Backoff
//!
//! Deterministic exponential backoff with a ceiling: the first attempt runs
//! immediately, attempt `i` waits `min(retry_delay * 2^(i-1), retry_max_delay)`
//! before running. No jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// How many times, and how patiently, an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. `0` means a single attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Upper bound for any single delay.
    pub retry_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Total number of attempts, the initial one included.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// The sleep that precedes attempt `attempt`. Attempt `0` never sleeps.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }

    /// The successive retry delays, starting with the one before attempt 1.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.retry_delay.min(self.retry_max_delay),
            max: self.retry_max_delay,
        }
    }
}

/// Infinite iterator over capped, doubling delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }
}

/// Returned when every attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts performed, the initial one included.
    pub attempts: u32,
    /// The error of the final attempt.
    pub last_error: E,
}

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// `action` names the operation in log lines ("database connection",
/// "redis ping", ...).
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    action: &str,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = policy.backoff();
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = delays.next().unwrap_or(policy.retry_max_delay);
            info!(
                retry = attempt,
                max_retries = policy.max_retries,
                delay = ?delay,
                "retrying {}", action
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, error = %e, "{} failed", action);
                if attempt >= policy.max_retries {
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    });
                }
            }
        }
        attempt += 1;
    }
}
