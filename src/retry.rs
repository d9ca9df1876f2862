//! Bounded retry with exponential backoff
//!
//! [`retry`] runs an async operation until it succeeds, the classifier marks
//! an error as fatal, or the attempt budget is spent. It knows nothing about
//! drivers so it can be tested on its own.

use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How the classifier treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Worth another attempt after a backoff
    Transient,
    /// Give up immediately
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Cap for the doubled delay
    pub max_delay: Duration,
    /// Add up to 10% random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after `failures` failed attempts: base, 2*base, 4*base, ... capped
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if !self.jitter {
            return delay;
        }
        let jitter_range = delay.as_millis() as u64 / 10;
        if jitter_range == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range))
    }
}

/// Final error of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Attempts made, including the failing one
    pub attempts: u32,
    /// True when the budget ran out on a transient error
    pub exhausted: bool,
}

/// Run `operation` under `policy`, classifying each error with `classify`.
///
/// The operation receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Retry,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if classify(&error) == Retry::Fatal {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: false,
                    });
                }
                if attempt >= max_attempts {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted: true,
                    });
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
