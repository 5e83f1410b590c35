//! Bounded-attempt retry with exponential backoff.

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff and timeout schedule for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base_delay: config.base_delay,
            factor: config.factor,
            initial_timeout: config.initial_timeout,
            max_timeout: config.max_timeout,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, factor: f64) -> Self {
        self.base_delay = base_delay;
        self.factor = factor;
        self
    }

    /// Delay after the failed attempt `attempt`: `base_delay * factor^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exp);
        if millis.is_finite() && millis < u64::MAX as f64 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }

    /// Timeout granted to attempt `attempt`: doubles each attempt, capped at `max_timeout`.
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        self.initial_timeout
            .saturating_mul(1u32 << shift)
            .min(self.max_timeout)
    }
}

/// Runs an attempt function until it succeeds, the predicate refuses a
/// retry, or the attempt budget is spent. The last error is returned.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry with the default classifier ([`Error::is_retryable`]).
    pub async fn execute<T, F, Fut>(&self, attempt_fn: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(attempt_fn, |e, _| e.is_retryable(), |_, _| {})
            .await
    }

    /// Retry with a custom predicate and an observer called on every failed attempt.
    pub async fn execute_with<T, F, Fut, P, O>(
        &self,
        mut attempt_fn: F,
        should_retry: P,
        mut on_error: O,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error, u32) -> bool,
        O: FnMut(&Error, u32),
    {
        let attempts = self.policy.attempts;
        let mut attempt = 0u32;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "attempt succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    on_error(&err, attempt);
                    let last = attempt + 1 >= attempts;
                    if last || !should_retry(&err, attempt) {
                        return Err(err);
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `fut` under the timeout scheduled for `attempt`.
pub async fn with_attempt_timeout<T, Fut>(policy: &RetryPolicy, attempt: u32, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let limit = policy.attempt_timeout(attempt);
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            after_ms: limit.as_millis() as u64,
        }),
    }
}
