//! Retry executor with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, DEFAULT_RETRY_AFTER, is_retryable_error};
use crate::util::{duration_from_millis_f64, sleep_or_cancel};

/// Fraction of the computed delay used as the jitter half-width.
const JITTER_RATIO: f64 = 0.1;

/// Retry configuration with exponential backoff.
///
/// Delay before retry `k` (1-indexed) is
/// `min(max_delay, initial_delay * backoff_multiplier^(k-1))`, perturbed by
/// up to ±10% when `jitter` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Deterministic delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw = initial_ms * self.backoff_multiplier.powi(exponent);
        duration_from_millis_f64(raw.min(max_ms))
    }

    /// Delay actually slept, with jitter applied when enabled.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        base.mul_f64(1.0 + factor)
    }

    /// Same limits with at least doubling delays and jitter on.
    pub fn exponential(&self) -> Self {
        Self {
            backoff_multiplier: self.backoff_multiplier.max(2.0),
            jitter: true,
            ..*self
        }
    }
}

/// Run `operation` up to `config.max_attempts` times.
///
/// Non-retryable errors are returned immediately; once attempts are
/// exhausted the last error is returned.
pub async fn execute_with_retry<F, Fut, T, E>(
    mut operation: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<AppError>,
{
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e.into(),
        };

        let Some(delay) = next_delay(config, attempt, &err) else {
            return Err(err);
        };
        sleep_or_cancel(delay, cancel).await?;
        attempt += 1;
    }
}

/// Backoff before the attempt following failed attempt `attempt`, or `None`
/// when `err` is not retryable or `config.max_attempts` is used up.
pub fn next_delay(config: &RetryConfig, attempt: u32, err: &AppError) -> Option<Duration> {
    let max_attempts = config.max_attempts.max(1);
    if !is_retryable_error(err) {
        tracing::debug!(attempt, error = %err, "Not retrying non-retryable error");
        return None;
    }
    if attempt >= max_attempts {
        tracing::warn!(attempts = attempt, error = %err, "Retry attempts exhausted");
        return None;
    }

    let delay = config.backoff_delay(attempt);
    tracing::warn!(
        attempt,
        max_attempts,
        delay_ms = %delay.as_millis(),
        error = %err,
        "Operation failed, retrying"
    );
    Some(delay)
}

/// Wait out a rate limit, then call `operation` exactly once more.
///
/// Waits for the error's Retry-After, or 60 seconds if it has none.
pub async fn handle_rate_limit<F, Fut, T, E>(
    error: &AppError,
    operation: F,
    cancel: &CancellationToken,
) -> Result<T, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<AppError>,
{
    let wait = error.retry_after().unwrap_or(DEFAULT_RETRY_AFTER);
    tracing::info!(wait_ms = %wait.as_millis(), "Rate limited, waiting before retry");
    sleep_or_cancel(wait, cancel).await?;
    operation().await.map_err(Into::into)
}
