//! Circuit breaker pattern for API resilience.
//!
//! Protects against cascading failures when a platform API (Reddit,
//! HackerNews) keeps failing: after enough consecutive failures the breaker
//! opens and callers fail fast until a cooldown has passed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <----------------------[success_threshold successes]-------------+
//! ```
//!
//! Half-open admits at most `half_open_max_attempts` trials at a time. A
//! trial frees its slot when it succeeds without closing the circuit or
//! ends without an outcome (cancelled). Slots held by trials that never
//! report back are reclaimed once `timeout` passes without a new trial.
//!
//! The state machine itself is [`BreakerState::apply`], a pure function of
//! `(state, event, config)`. [`CircuitBreaker`] wraps it in a mutex and adds
//! logging and bookkeeping.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, ErrorKind};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful requests in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait after the last failure before probing again.
    pub timeout: Duration,

    /// Maximum number of trial calls admitted while half-open.
    pub half_open_max_attempts: u32,
}

impl CircuitBreakerConfig {
    /// Reject settings under which the circuit could never close.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 || self.half_open_max_attempts == 0 {
            return Err(AppError::configuration(
                "circuit_breaker",
                "Circuit breaker thresholds and half-open attempts must be at least 1",
            ));
        }
        if self.success_threshold > self.half_open_max_attempts {
            return Err(AppError::configuration(
                "circuit_breaker",
                format!(
                    "success_threshold ({}) must not exceed half_open_max_attempts ({})",
                    self.success_threshold, self.half_open_max_attempts
                ),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Time has passed; an open circuit may become half-open.
    Poll { now: Instant },
    /// A half-open trial call was admitted.
    TrialStarted { now: Instant },
    /// An admitted trial ended without a success or failure to record.
    TrialReleased,
    Success,
    Failure { now: Instant },
    Reset,
}

/// State and counters of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    /// Half-open trials currently holding a slot.
    pub half_open_attempts: u32,
    pub last_trial_time: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_attempts: 0,
            last_trial_time: None,
        }
    }
}

impl BreakerState {
    /// The transition function.
    pub fn apply(self, event: BreakerEvent, config: &CircuitBreakerConfig) -> Self {
        use CircuitState::{Closed, HalfOpen, Open};

        match (self.state, event) {
            (_, BreakerEvent::Reset) => Self::default(),

            (Open, BreakerEvent::Poll { now }) if self.cooldown_elapsed(now, config) => {
                self.enter(HalfOpen)
            }
            (HalfOpen, BreakerEvent::Poll { now }) if self.trials_stalled(now, config) => {
                self.enter(HalfOpen)
            }
            (_, BreakerEvent::Poll { .. }) => self,

            (HalfOpen, BreakerEvent::TrialStarted { now }) => Self {
                half_open_attempts: self.half_open_attempts + 1,
                last_trial_time: Some(now),
                ..self
            },
            (_, BreakerEvent::TrialStarted { .. }) => self,

            (HalfOpen, BreakerEvent::TrialReleased) => Self {
                half_open_attempts: self.half_open_attempts.saturating_sub(1),
                ..self
            },
            (_, BreakerEvent::TrialReleased) => self,

            (Closed, BreakerEvent::Success) => Self {
                failure_count: 0,
                ..self
            },
            (HalfOpen, BreakerEvent::Success) => {
                let next = Self {
                    success_count: self.success_count + 1,
                    half_open_attempts: self.half_open_attempts.saturating_sub(1),
                    ..self
                };
                if next.success_count >= config.success_threshold {
                    next.enter(Closed)
                } else {
                    next
                }
            }
            (Open, BreakerEvent::Success) => self,

            (Closed, BreakerEvent::Failure { now }) => {
                let next = Self {
                    failure_count: self.failure_count + 1,
                    last_failure_time: Some(now),
                    ..self
                };
                if next.failure_count >= config.failure_threshold {
                    next.enter(Open)
                } else {
                    next
                }
            }
            (HalfOpen, BreakerEvent::Failure { now }) => Self {
                last_failure_time: Some(now),
                ..self
            }
            .enter(Open),
            (Open, BreakerEvent::Failure { now }) => Self {
                last_failure_time: Some(now),
                ..self
            },
        }
    }

    /// Whether a call may run in the current state. Pure; apply
    /// [`BreakerEvent::Poll`] first to observe an expired cooldown.
    pub fn permits(&self, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.half_open_attempts < config.half_open_max_attempts,
        }
    }

    pub fn time_until_half_open(&self, now: Instant, config: &CircuitBreakerConfig) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .last_failure_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(config.timeout);
        Some(config.timeout.saturating_sub(elapsed))
    }

    fn cooldown_elapsed(&self, now: Instant, config: &CircuitBreakerConfig) -> bool {
        match self.last_failure_time {
            Some(t) => now.saturating_duration_since(t) >= config.timeout,
            None => true,
        }
    }

    /// Every trial slot is taken and none was started for a full `timeout`.
    fn trials_stalled(&self, now: Instant, config: &CircuitBreakerConfig) -> bool {
        if self.half_open_attempts < config.half_open_max_attempts {
            return false;
        }
        match self.last_trial_time {
            Some(t) => now.saturating_duration_since(t) >= config.timeout,
            None => true,
        }
    }

    fn enter(self, state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self {
                state,
                failure_count: 0,
                success_count: 0,
                half_open_attempts: 0,
                ..self
            },
            CircuitState::HalfOpen => Self {
                state,
                success_count: 0,
                half_open_attempts: 0,
                last_trial_time: None,
                ..self
            },
            CircuitState::Open => Self {
                state,
                half_open_attempts: 0,
                ..self
            },
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    machine: BreakerState,
    last_error_message: Option<String>,
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_attempts: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker guarding one named operation.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner {
                machine: BreakerState::default(),
                last_error_message: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn transition(&self, inner: &mut CircuitBreakerInner, event: BreakerEvent) {
        let before = inner.machine.state;
        inner.machine = inner.machine.apply(event, &self.config);
        let after = inner.machine.state;
        if before == after {
            return;
        }

        match after {
            CircuitState::Open => tracing::warn!(
                circuit = %self.name,
                failures = inner.machine.failure_count,
                from = %before,
                "Circuit breaker opening"
            ),
            CircuitState::HalfOpen => tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            ),
            CircuitState::Closed => tracing::info!(
                circuit = %self.name,
                from = %before,
                "Circuit breaker closing"
            ),
        }
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, BreakerEvent::Poll { now: Instant::now() });
        inner.machine.state
    }

    /// Snapshot of state and counters, without advancing the machine.
    pub fn snapshot(&self) -> BreakerState {
        self.lock_inner().machine
    }

    /// Admission check.
    ///
    /// An open circuit whose cooldown has expired moves to half-open here.
    /// Every admitted half-open call counts as one trial, so at most
    /// `half_open_max_attempts` trials run before the circuit resolves.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, BreakerEvent::Poll { now: Instant::now() });

        let allowed = inner.machine.permits(&self.config);
        if allowed && inner.machine.state == CircuitState::HalfOpen {
            self.transition(&mut inner, BreakerEvent::TrialStarted { now: Instant::now() });
            tracing::debug!(
                circuit = %self.name,
                attempt = inner.machine.half_open_attempts,
                "Admitting half-open trial"
            );
        }
        allowed
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        self.transition(&mut inner, BreakerEvent::Poll { now });

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.machine.state,
            failure_count: inner.machine.failure_count,
            success_count: inner.machine.success_count,
            half_open_attempts: inner.machine.half_open_attempts,
            last_error: inner.last_error_message.clone(),
            time_until_half_open: inner.machine.time_until_half_open(now, &self.config),
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns a `CIRCUIT_BREAKER_OPEN` error immediately
    /// - HalfOpen: executes as a trial if the trial budget allows
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.can_execute() {
            return Err(self.open_error());
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if matches!(e.kind, ErrorKind::Cancelled) => self.release_trial(),
            Err(e) => self.record_failure(e),
        }

        result
    }

    /// The error returned for calls rejected by this breaker.
    pub fn open_error(&self) -> AppError {
        let stats = self.stats();
        let mut err = AppError::circuit_open(&self.name);
        if let Some(retry_in) = stats.time_until_half_open {
            err.add_context([("retry_after_ms", retry_in.as_millis() as u64)]);
        }
        err
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, BreakerEvent::Success);
        if inner.machine.state == CircuitState::Closed {
            inner.last_error_message = None;
        }
    }

    /// Give back a half-open trial slot for a call that was admitted but
    /// produced no outcome. No-op in other states.
    pub fn release_trial(&self) {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, BreakerEvent::TrialReleased);
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.last_error_message = Some(error.to_string());
        self.transition(&mut inner, BreakerEvent::Failure { now: Instant::now() });
        tracing::debug!(
            circuit = %self.name,
            failures = inner.machine.failure_count,
            error = %error,
            "Circuit breaker recorded failure"
        );
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        self.transition(&mut inner, BreakerEvent::Reset);
        inner.last_error_message = None;
    }
}
