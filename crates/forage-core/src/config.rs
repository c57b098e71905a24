use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::degradation::DegradationConfig;
use crate::error::AppError;
use crate::notify::{NotificationConfig, NotificationLevel};
use crate::retry::RetryConfig;

/// Configuration for an [`ErrorHandler`](crate::handler::ErrorHandler).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub notification: NotificationConfig,
    pub degradation: DegradationConfig,
}

impl ResilienceConfig {
    /// Read configuration from environment variables.
    ///
    /// Every variable is optional; unset ones keep their default.
    ///
    /// - `FORAGE_RETRY_MAX_ATTEMPTS` (default 3)
    /// - `FORAGE_RETRY_INITIAL_DELAY_MS` (default 1000)
    /// - `FORAGE_RETRY_MAX_DELAY_MS` (default 30000)
    /// - `FORAGE_RETRY_BACKOFF_MULTIPLIER` (default 2.0)
    /// - `FORAGE_RETRY_JITTER` (default true)
    /// - `FORAGE_CB_FAILURE_THRESHOLD` (default 5)
    /// - `FORAGE_CB_SUCCESS_THRESHOLD` (default 2)
    /// - `FORAGE_CB_TIMEOUT_MS` (default 60000)
    /// - `FORAGE_CB_HALF_OPEN_MAX_ATTEMPTS` (default 3)
    /// - `FORAGE_DEGRADATION_THRESHOLD` (default 3)
    /// - `FORAGE_DEGRADATION_AUTO_RECOVER` (default true)
    /// - `FORAGE_DEGRADATION_RECOVERY_MS` (default 300000)
    /// - `FORAGE_NOTIFY_ENABLED` (default true)
    /// - `FORAGE_NOTIFY_MIN_LEVEL` (default `warning`)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(lookup);

        let retry = RetryConfig {
            max_attempts: env.positive("FORAGE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_delay: env.millis("FORAGE_RETRY_INITIAL_DELAY_MS", defaults.retry.initial_delay)?,
            max_delay: env.millis("FORAGE_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
            backoff_multiplier: env.multiplier(
                "FORAGE_RETRY_BACKOFF_MULTIPLIER",
                defaults.retry.backoff_multiplier,
            )?,
            jitter: env.flag("FORAGE_RETRY_JITTER", defaults.retry.jitter)?,
        };
        if retry.max_delay < retry.initial_delay {
            return Err(AppError::configuration(
                "FORAGE_RETRY_MAX_DELAY_MS",
                "FORAGE_RETRY_MAX_DELAY_MS must not be below FORAGE_RETRY_INITIAL_DELAY_MS",
            ));
        }

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env.positive(
                "FORAGE_CB_FAILURE_THRESHOLD",
                defaults.circuit_breaker.failure_threshold,
            )?,
            success_threshold: env.positive(
                "FORAGE_CB_SUCCESS_THRESHOLD",
                defaults.circuit_breaker.success_threshold,
            )?,
            timeout: env.millis("FORAGE_CB_TIMEOUT_MS", defaults.circuit_breaker.timeout)?,
            half_open_max_attempts: env.positive(
                "FORAGE_CB_HALF_OPEN_MAX_ATTEMPTS",
                defaults.circuit_breaker.half_open_max_attempts,
            )?,
        };
        if circuit_breaker.success_threshold > circuit_breaker.half_open_max_attempts {
            return Err(AppError::configuration(
                "FORAGE_CB_SUCCESS_THRESHOLD",
                "FORAGE_CB_SUCCESS_THRESHOLD must not exceed FORAGE_CB_HALF_OPEN_MAX_ATTEMPTS",
            ));
        }

        let degradation = DegradationConfig {
            enabled: defaults.degradation.enabled,
            threshold: env.positive("FORAGE_DEGRADATION_THRESHOLD", defaults.degradation.threshold)?,
            auto_recover: env.flag(
                "FORAGE_DEGRADATION_AUTO_RECOVER",
                defaults.degradation.auto_recover,
            )?,
            recovery_check_interval: env.millis(
                "FORAGE_DEGRADATION_RECOVERY_MS",
                defaults.degradation.recovery_check_interval,
            )?,
        };

        let notification = NotificationConfig {
            enabled: env.flag("FORAGE_NOTIFY_ENABLED", defaults.notification.enabled)?,
            min_level: env.parsed::<NotificationLevel>(
                "FORAGE_NOTIFY_MIN_LEVEL",
                defaults.notification.min_level,
                "one of info, warning, error, critical",
            )?,
        };

        Ok(Self {
            retry,
            circuit_breaker,
            notification,
            degradation,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T, expected: &str) -> Result<T, AppError> {
        match self.raw(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                AppError::configuration(key, format!("Invalid {key} '{raw}': must be {expected}"))
            }),
        }
    }

    fn positive(&self, key: &str, default: u32) -> Result<u32, AppError> {
        let value = self.parsed(key, default, "a positive integer")?;
        if value == 0 {
            return Err(AppError::configuration(key, format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        let default_ms = default.as_millis() as u64;
        self.parsed(key, default_ms, "a whole number of milliseconds")
            .map(Duration::from_millis)
    }

    fn multiplier(&self, key: &str, default: f64) -> Result<f64, AppError> {
        let value: f64 = self.parsed(key, default, "a number")?;
        if !value.is_finite() || value < 1.0 {
            return Err(AppError::configuration(key, format!("{key} must be at least 1.0")));
        }
        Ok(value)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, AppError> {
        match self.raw(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(AppError::configuration(
                    key,
                    format!("Invalid {key} '{v}': must be true or false"),
                )),
            },
        }
    }
}
