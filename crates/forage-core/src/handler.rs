//! Error-handling orchestrator.
//!
//! [`ErrorHandler::handle`] runs a named operation through degradation
//! checks, circuit-breaker admission, execution, error classification, and
//! recovery:
//!
//! 1. degraded service with a fallback → fallback value, operation skipped
//! 2. breaker rejects → `CIRCUIT_BREAKER_OPEN`
//! 3. success → breaker success, error streak cleared, service restored
//! 4. failure → context attached, streak counted, notification emitted,
//!    breaker failure, then a [`RecoveryStrategy`] is chosen and applied
//!
//! Retry-type strategies repeat steps 1–4 for every further attempt, so an
//! open breaker stops a recovery loop and each failed retry is counted.
//! Cancellation skips step 4 entirely.
//!
//! One handler is built at the application root and shared via `Arc`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::ResilienceConfig;
use crate::degradation::DegradationTracker;
use crate::error::{AppError, ErrorKind, ErrorSeverity, RecoveryStrategy, is_retryable_error};
use crate::notify::{NotificationSink, Notifier, TracingSink};
use crate::retry::{self, RetryConfig};
use crate::util::sleep_or_cancel;

/// Zero-argument producer of a substitute result.
pub type FallbackFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Outcome of a single admitted execution.
enum Attempt<T> {
    /// The operation's value, or a degraded service's fallback.
    Done(T),
    /// Not counted as a failure: open breaker or cancellation.
    Rejected(AppError),
    /// Failed and recorded against the breaker and the service.
    Failed(AppError),
}

/// Caller-supplied metadata attached to error context on failure.
#[derive(Debug, Clone, Default)]
pub struct OperationMetadata {
    /// Set while already inside a recovery path; retry-type strategies
    /// then return the error instead of recursing.
    pub is_retrying: bool,
    pub fields: BTreeMap<String, Value>,
}

/// Per-call options for [`ErrorHandler::handle`].
pub struct HandleOptions<T> {
    /// Operation name; keys the circuit breaker.
    pub name: String,
    /// Service name for degradation tracking and fallbacks. Defaults to `name`.
    pub service: Option<String>,
    pub fallback: Option<FallbackFn<T>>,
    pub metadata: OperationMetadata,
}

impl<T> Clone for HandleOptions<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            service: self.service.clone(),
            fallback: self.fallback.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl<T> HandleOptions<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: None,
            fallback: None,
            metadata: OperationMetadata::default(),
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn fallback(mut self, fallback: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.fields.insert(key.into(), value.into());
        self
    }

    pub fn retrying(mut self) -> Self {
        self.metadata.is_retrying = true;
        self
    }

    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }
}

/// Point-in-time view of the handler for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub degraded_services: Vec<String>,
    pub error_counts: BTreeMap<String, u32>,
}

pub struct ErrorHandler {
    retry_config: RetryConfig,
    circuit_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    degradation: DegradationTracker,
    notifier: Notifier,
    /// Values are `FallbackFn<T>` for the `T` they were registered with.
    fallbacks: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    cancel: CancellationToken,
}

impl ErrorHandler {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: ResilienceConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let notifier = Notifier::new(config.notification, sink);
        Self {
            retry_config: config.retry,
            circuit_config: config.circuit_breaker,
            breakers: Mutex::new(HashMap::new()),
            degradation: DegradationTracker::new(config.degradation, notifier.clone()),
            notifier,
            fallbacks: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to abort every wait this handler performs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// Wrap `operation` so every call goes through [`ErrorHandler::handle`].
    pub fn guard<F, T>(self: &Arc<Self>, options: HandleOptions<T>, operation: F) -> Guarded<F, T> {
        Guarded {
            handler: Arc::clone(self),
            options,
            operation,
        }
    }

    /// Register the fallback used for `service` when the caller supplies none.
    pub fn register_fallback<T: 'static>(
        &self,
        service: impl Into<String>,
        fallback: impl Fn() -> T + Send + Sync + 'static,
    ) {
        let fallback: FallbackFn<T> = Arc::new(fallback);
        let mut fallbacks = self.fallbacks.write().unwrap_or_else(|p| p.into_inner());
        fallbacks.insert(service.into(), Arc::new(fallback));
    }

    fn registered_fallback<T: 'static>(&self, service: &str) -> Option<FallbackFn<T>> {
        let fallbacks = self.fallbacks.read().unwrap_or_else(|p| p.into_inner());
        fallbacks
            .get(service)
            .and_then(|f| f.downcast_ref::<FallbackFn<T>>())
            .cloned()
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker map mutex");
            poisoned.into_inner()
        })
    }

    fn breaker(&self, name: &str) -> CircuitBreaker {
        self.lock_breakers()
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.circuit_config))
            .clone()
    }

    /// Run `operation` with full error handling.
    ///
    /// Returns `Ok(None)` only when the failure was classified as ignorable.
    pub async fn handle<F, Fut, T, E>(
        &self,
        mut operation: F,
        options: HandleOptions<T>,
    ) -> Result<Option<T>, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
        T: 'static,
    {
        let service = options.service_name().to_string();
        let fallback = options
            .fallback
            .clone()
            .or_else(|| self.registered_fallback::<T>(&service));

        let err = match self
            .attempt(&mut operation, &options, &service, fallback.as_ref())
            .await
        {
            Attempt::Done(value) => return Ok(Some(value)),
            Attempt::Rejected(err) => return Err(err),
            Attempt::Failed(err) => err,
        };

        let strategy = determine_strategy(&err, fallback.is_some());
        tracing::debug!(operation = %options.name, strategy = %strategy, "Applying recovery strategy");

        let retrying = options.metadata.is_retrying;
        match strategy {
            RecoveryStrategy::Retry
            | RecoveryStrategy::ExponentialBackoff
            | RecoveryStrategy::CircuitBreaker
                if retrying =>
            {
                Err(err)
            }
            RecoveryStrategy::Retry => {
                self.notifier
                    .recovery(&format!("Retrying '{}' after: {err}", options.name));
                let options = options.clone().retrying();
                self.reattempt(
                    &mut operation,
                    &options,
                    &service,
                    fallback.as_ref(),
                    &self.retry_config,
                )
                .await
                .map(Some)
            }
            RecoveryStrategy::ExponentialBackoff => {
                self.notifier
                    .recovery(&format!("Backing off '{}' after: {err}", options.name));
                let options = options.clone().retrying();
                let config = self.retry_config.exponential();
                self.reattempt(&mut operation, &options, &service, fallback.as_ref(), &config)
                .await
                .map(Some)
            }
            RecoveryStrategy::CircuitBreaker => {
                self.notifier.recovery(&format!(
                    "Retrying '{}' behind circuit breaker after: {err}",
                    options.name
                ));
                let options = options.clone().retrying();
                self.reattempt(
                    &mut operation,
                    &options,
                    &service,
                    fallback.as_ref(),
                    &self.retry_config,
                )
                .await
                .map(Some)
            }
            RecoveryStrategy::Fallback => match fallback {
                Some(fallback) => {
                    self.notifier
                        .recovery(&format!("Using fallback for '{}'", options.name));
                    Ok(Some(fallback()))
                }
                None => Err(err),
            },
            RecoveryStrategy::Ignore => {
                tracing::debug!(operation = %options.name, error = %err, "Ignoring error");
                Ok(None)
            }
            RecoveryStrategy::Terminate => Err(err),
        }
    }

    /// One pass through degradation check, breaker admission, execution and
    /// failure accounting.
    async fn attempt<F, Fut, T, E>(
        &self,
        operation: &mut F,
        options: &HandleOptions<T>,
        service: &str,
        fallback: Option<&FallbackFn<T>>,
    ) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        if self.degradation.is_degraded(service)
            && let Some(fallback) = fallback
        {
            tracing::debug!(operation = %options.name, service = %service, "Service degraded, using fallback");
            return Attempt::Done(fallback());
        }

        let breaker = self.breaker(&options.name);
        if !breaker.can_execute() {
            tracing::warn!(operation = %options.name, "Rejected by open circuit breaker");
            return Attempt::Rejected(breaker.open_error());
        }

        let mut err: AppError = match operation().await {
            Ok(value) => {
                breaker.record_success();
                self.degradation.record_success(service);
                return Attempt::Done(value);
            }
            Err(e) => e.into(),
        };

        err.add_context([("operation", Value::from(options.name.as_str()))]);
        err.add_context(options.metadata.fields.clone());

        if matches!(err.kind, ErrorKind::Cancelled) {
            breaker.release_trial();
            tracing::debug!(operation = %options.name, "Operation cancelled");
            return Attempt::Rejected(err);
        }

        self.degradation.record_error(service);
        self.notifier.error(&options.name, &err);
        log_failure(&options.name, &err);
        breaker.record_failure(&err);
        Attempt::Failed(err)
    }

    /// Recovery loop: up to `config.max_attempts` further attempts, each
    /// admitted and recorded like the first. Stops early on an open breaker,
    /// cancellation, or a non-retryable error.
    async fn reattempt<F, Fut, T, E>(
        &self,
        operation: &mut F,
        options: &HandleOptions<T>,
        service: &str,
        fallback: Option<&FallbackFn<T>>,
        config: &RetryConfig,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        let mut attempt = 1;
        loop {
            let err = match self.attempt(operation, options, service, fallback).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Rejected(err) => return Err(err),
                Attempt::Failed(err) => err,
            };
            let Some(delay) = retry::next_delay(config, attempt, &err) else {
                return Err(err);
            };
            sleep_or_cancel(delay, &self.cancel).await?;
            attempt += 1;
        }
    }

    /// Retry `operation` with the given configuration.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation: F,
        config: &RetryConfig,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        retry::execute_with_retry(operation, config, &self.cancel).await
    }

    /// Retry with at least doubling, jittered delays.
    pub async fn execute_with_backoff<F, Fut, T, E>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        let config = self.retry_config.exponential();
        retry::execute_with_retry(operation, &config, &self.cancel).await
    }

    /// Retry `operation` behind the breaker named `name`.
    ///
    /// Every attempt must pass admission, so once the breaker opens the
    /// remaining attempts become `CIRCUIT_BREAKER_OPEN` without running.
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        name: &str,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        let breaker = self.breaker(name);
        let mut attempt = 1;
        loop {
            let outcome = breaker
                .call(|| {
                    let fut = operation();
                    async move { fut.await.map_err(Into::<AppError>::into) }
                })
                .await;
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(delay) = retry::next_delay(&self.retry_config, attempt, &err) else {
                return Err(err);
            };
            sleep_or_cancel(delay, &self.cancel).await?;
            attempt += 1;
        }
    }

    /// Wait out `error`'s Retry-After (60s default), then call once more.
    pub async fn handle_rate_limit<F, Fut, T, E>(
        &self,
        error: &AppError,
        operation: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
    {
        retry::handle_rate_limit(error, operation, &self.cancel).await
    }

    pub fn circuit_breaker_state(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.lock_breakers().get(name).map(CircuitBreaker::stats)
    }

    /// Returns `false` if no breaker exists for `name`.
    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        match self.lock_breakers().get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn clear_error_count(&self, service: &str) {
        self.degradation.clear(service);
    }

    pub fn error_count(&self, service: &str) -> u32 {
        self.degradation.error_count(service)
    }

    pub fn degraded_services(&self) -> Vec<String> {
        self.degradation.degraded_services()
    }

    pub fn stats(&self) -> HandlerStats {
        let mut circuit_breakers: Vec<_> =
            self.lock_breakers().values().map(CircuitBreaker::stats).collect();
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));

        HandlerStats {
            circuit_breakers,
            degraded_services: self.degradation.degraded_services(),
            error_counts: self.degradation.error_counts().into_iter().collect(),
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

/// Choose how to respond to a failure.
///
/// The error's own suggestion wins; otherwise a fallback is preferred for
/// anything short of critical, then the error's shape decides.
pub fn determine_strategy(err: &AppError, has_fallback: bool) -> RecoveryStrategy {
    if let Some(strategy) = err.recovery_strategy {
        return strategy;
    }
    if has_fallback && err.severity != ErrorSeverity::Critical {
        return RecoveryStrategy::Fallback;
    }
    if err.is_rate_limit() {
        RecoveryStrategy::ExponentialBackoff
    } else if err.is_network() {
        RecoveryStrategy::CircuitBreaker
    } else if is_retryable_error(err) {
        RecoveryStrategy::Retry
    } else if err.severity == ErrorSeverity::Critical {
        RecoveryStrategy::Terminate
    } else {
        RecoveryStrategy::Ignore
    }
}

fn log_failure(operation: &str, err: &AppError) {
    match err.severity {
        ErrorSeverity::Low => {
            tracing::info!(operation = %operation, code = %err.code, error = %err, "Operation failed")
        }
        ErrorSeverity::Medium => {
            tracing::warn!(operation = %operation, code = %err.code, error = %err, "Operation failed")
        }
        ErrorSeverity::High | ErrorSeverity::Critical => tracing::error!(
            operation = %operation,
            code = %err.code,
            severity = %err.severity,
            error = %err,
            "Operation failed"
        ),
    }
}

/// An operation bound to a handler and options; see [`ErrorHandler::guard`].
pub struct Guarded<F, T> {
    handler: Arc<ErrorHandler>,
    options: HandleOptions<T>,
    operation: F,
}

impl<F, T> Guarded<F, T> {
    pub async fn call<Fut, E>(&self) -> Result<Option<T>, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<AppError>,
        T: 'static,
    {
        self.handler
            .handle(&self.operation, self.options.clone())
            .await
    }
}
