//! Token-bucket rate limiting for outbound API requests.
//!
//! A [`TokenBucket`] accumulates tokens continuously at `refill_rate` per
//! second up to `capacity`; every request spends tokens. Refill is lazy and
//! proportional to elapsed time, so the bucket is exact regardless of how
//! often it is polled. [`MultiTierTokenBucket`] stacks several buckets (per
//! second, per minute, per hour) and admits a request only when every tier
//! can pay for it.
//!
//! # Example
//!
//! ```rust,no_run
//! use forage_core::token_bucket::MultiTierTokenBucket;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), forage_core::AppError> {
//! // 10 req/s, 300 req/min, 10k req/h
//! let limiter = MultiTierTokenBucket::multi_tier(10.0, 300.0, 10_000.0)?;
//! let cancel = CancellationToken::new();
//!
//! if !limiter.try_consume_all(1.0) {
//!     limiter.consume_all(1.0, &cancel).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::util::{duration_from_millis_f64, sleep_or_cancel};

/// Slack for float rounding when comparing balances.
const EPSILON: f64 = 1e-9;

/// Token amounts must be finite and non-negative.
fn is_valid_amount(tokens: f64) -> bool {
    tokens.is_finite() && tokens >= 0.0
}

/// Configuration for a single bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum balance (burst size).
    pub capacity: f64,

    /// Tokens added per second.
    pub refill_rate: f64,

    /// Starting balance. Defaults to `capacity`.
    pub initial_tokens: Option<f64>,
}

impl TokenBucketConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            initial_tokens: None,
        }
    }

    pub fn with_initial_tokens(mut self, tokens: f64) -> Self {
        self.initial_tokens = Some(tokens);
        self
    }

    fn validate(&self) -> Result<(), AppError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(AppError::configuration(
                "capacity",
                format!("Token bucket capacity must be positive, got {}", self.capacity),
            ));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(AppError::configuration(
                "refill_rate",
                format!(
                    "Token bucket refill rate must be positive, got {}",
                    self.refill_rate
                ),
            ));
        }
        if let Some(initial) = self.initial_tokens
            && !(initial.is_finite() && initial >= 0.0)
        {
            return Err(AppError::configuration(
                "initial_tokens",
                format!("Initial tokens must be non-negative, got {initial}"),
            ));
        }
        Ok(())
    }
}

/// Snapshot of a bucket's balance and counters.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    #[serde(skip)]
    pub last_refill: Instant,
    pub total_consumed: f64,
    pub total_generated: f64,
}

#[derive(Debug)]
struct TokenBucketInner {
    tokens: f64,
    last_refill: Instant,
    total_consumed: f64,
    total_generated: f64,
}

impl TokenBucketInner {
    fn refill(&mut self, config: &TokenBucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let headroom = (config.capacity - self.tokens).max(0.0);
        let added = (elapsed * config.refill_rate).min(headroom);
        self.tokens += added;
        self.total_generated += added;
        self.last_refill = now;
    }

    fn can_afford(&self, tokens: f64) -> bool {
        is_valid_amount(tokens) && self.tokens + EPSILON >= tokens
    }

    fn take(&mut self, tokens: f64) {
        self.tokens = (self.tokens - tokens).max(0.0);
        self.total_consumed += tokens;
    }

    fn wait_for(&self, config: &TokenBucketConfig, tokens: f64) -> Duration {
        if self.can_afford(tokens) {
            return Duration::ZERO;
        }
        duration_from_millis_f64((tokens - self.tokens) / config.refill_rate * 1000.0)
    }
}

/// Thread-safe continuous-refill token bucket.
///
/// Cloning yields another handle to the same balance.
#[derive(Clone)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    inner: Arc<Mutex<TokenBucketInner>>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Result<Self, AppError> {
        config.validate()?;
        let tokens = config
            .initial_tokens
            .unwrap_or(config.capacity)
            .min(config.capacity);
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(TokenBucketInner {
                tokens,
                last_refill: Instant::now(),
                total_consumed: 0.0,
                total_generated: 0.0,
            })),
        })
    }

    /// `rate` requests per second; burst defaults to `rate`.
    pub fn per_second(rate: f64, burst: Option<f64>) -> Result<Self, AppError> {
        Self::per_unit(rate, burst, 1.0)
    }

    /// `rate` requests per minute; burst defaults to `rate`.
    pub fn per_minute(rate: f64, burst: Option<f64>) -> Result<Self, AppError> {
        Self::per_unit(rate, burst, 60.0)
    }

    /// `rate` requests per hour; burst defaults to `rate`.
    pub fn per_hour(rate: f64, burst: Option<f64>) -> Result<Self, AppError> {
        Self::per_unit(rate, burst, 3600.0)
    }

    fn per_unit(rate: f64, burst: Option<f64>, unit_secs: f64) -> Result<Self, AppError> {
        Self::new(TokenBucketConfig::new(
            burst.unwrap_or(rate),
            rate / unit_secs,
        ))
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, TokenBucketInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned token bucket mutex");
            poisoned.into_inner()
        })
    }

    /// Take `tokens` if the balance allows it. Never suspends.
    ///
    /// Negative and non-finite amounts are refused.
    pub fn try_consume(&self, tokens: f64) -> bool {
        if !is_valid_amount(tokens) {
            tracing::debug!(tokens, "Refusing invalid token amount");
            return false;
        }
        let mut inner = self.lock_inner();
        inner.refill(&self.config, Instant::now());
        if inner.can_afford(tokens) {
            inner.take(tokens);
            true
        } else {
            false
        }
    }

    /// Take `tokens`, suspending until the balance allows it.
    ///
    /// The balance is re-checked after every wait, so a competing consumer
    /// can lengthen the wait but never drive the balance negative.
    pub async fn consume(&self, tokens: f64, cancel: &CancellationToken) -> Result<(), AppError> {
        self.check_satisfiable(tokens)?;

        loop {
            let wait = {
                let mut inner = self.lock_inner();
                inner.refill(&self.config, Instant::now());
                if inner.can_afford(tokens) {
                    inner.take(tokens);
                    return Ok(());
                }
                inner.wait_for(&self.config, tokens)
            };

            tracing::debug!(
                tokens,
                wait_ms = %wait.as_millis(),
                "Waiting for token bucket refill"
            );
            sleep_or_cancel(wait, cancel).await?;
        }
    }

    /// Time until `tokens` could be taken; zero if they can be taken now.
    pub fn wait_time(&self, tokens: f64) -> Duration {
        let mut inner = self.lock_inner();
        inner.refill(&self.config, Instant::now());
        inner.wait_for(&self.config, tokens)
    }

    /// Whether `tokens` could be taken right now, without taking them.
    pub fn can_handle_burst(&self, tokens: f64) -> bool {
        if !is_valid_amount(tokens) {
            return false;
        }
        let mut inner = self.lock_inner();
        inner.refill(&self.config, Instant::now());
        inner.can_afford(tokens)
    }

    pub fn state(&self) -> TokenBucketState {
        let mut inner = self.lock_inner();
        inner.refill(&self.config, Instant::now());
        TokenBucketState {
            tokens: inner.tokens,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            last_refill: inner.last_refill,
            total_consumed: inner.total_consumed,
            total_generated: inner.total_generated,
        }
    }

    /// Refill to capacity and clear counters.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.tokens = self.config.capacity;
        inner.last_refill = Instant::now();
        inner.total_consumed = 0.0;
        inner.total_generated = 0.0;
    }

    fn check_satisfiable(&self, tokens: f64) -> Result<(), AppError> {
        if !is_valid_amount(tokens) {
            return Err(AppError::validation(format!(
                "Cannot consume {tokens} tokens"
            )));
        }
        if tokens > self.config.capacity {
            return Err(AppError::validation(format!(
                "Requested {tokens} tokens exceeds bucket capacity {}",
                self.config.capacity
            )));
        }
        Ok(())
    }
}

/// Several independent buckets admitted together.
///
/// A request is never partially throttled: either every tier pays, or none.
#[derive(Clone, Default)]
pub struct MultiTierTokenBucket {
    tiers: Arc<Mutex<BTreeMap<String, TokenBucket>>>,
}

impl MultiTierTokenBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conventional three-tier limiter with tiers `second`, `minute`, `hour`.
    pub fn multi_tier(per_second: f64, per_minute: f64, per_hour: f64) -> Result<Self, AppError> {
        let limiter = Self::new();
        limiter.add_bucket("second", TokenBucket::per_second(per_second, None)?)?;
        limiter.add_bucket("minute", TokenBucket::per_minute(per_minute, None)?)?;
        limiter.add_bucket("hour", TokenBucket::per_hour(per_hour, None)?)?;
        Ok(limiter)
    }

    fn lock_tiers(&self) -> MutexGuard<'_, BTreeMap<String, TokenBucket>> {
        self.tiers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned tier map mutex");
            poisoned.into_inner()
        })
    }

    /// Register a new tier. Names must be unique.
    pub fn add_tier(&self, name: impl Into<String>, config: TokenBucketConfig) -> Result<(), AppError> {
        self.add_bucket(name, TokenBucket::new(config)?)
    }

    fn add_bucket(&self, name: impl Into<String>, bucket: TokenBucket) -> Result<(), AppError> {
        let name = name.into();
        let mut tiers = self.lock_tiers();
        if tiers.contains_key(&name) {
            return Err(AppError::validation(format!(
                "Rate limit tier '{name}' already exists"
            )));
        }
        tiers.insert(name, bucket);
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<TokenBucket> {
        self.lock_tiers().get(name).cloned()
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.lock_tiers().keys().cloned().collect()
    }

    /// Take `tokens` from every tier, or from none.
    ///
    /// All tier locks are held (in name order) for the check and the
    /// deduction, so concurrent callers see either the before or the after.
    pub fn try_consume_all(&self, tokens: f64) -> bool {
        if !is_valid_amount(tokens) {
            tracing::debug!(tokens, "Refusing invalid token amount");
            return false;
        }
        let tiers = self.lock_tiers();
        let now = Instant::now();

        let mut guards: Vec<_> = tiers
            .values()
            .map(|bucket| (bucket.lock_inner(), &bucket.config))
            .collect();

        for (inner, config) in guards.iter_mut() {
            inner.refill(*config, now);
        }

        if let Some((name, _)) = tiers
            .keys()
            .zip(guards.iter())
            .find(|(_, (inner, _))| !inner.can_afford(tokens))
        {
            tracing::debug!(tier = %name, tokens, "Rate limit tier exhausted");
            return false;
        }

        for (inner, _) in guards.iter_mut() {
            inner.take(tokens);
        }
        true
    }

    /// Take `tokens` from every tier, suspending for the slowest tier.
    pub async fn consume_all(&self, tokens: f64, cancel: &CancellationToken) -> Result<(), AppError> {
        for bucket in self.lock_tiers().values() {
            bucket.check_satisfiable(tokens)?;
        }

        loop {
            let wait = self.wait_time(tokens);
            if wait.is_zero() && self.try_consume_all(tokens) {
                return Ok(());
            }

            tracing::debug!(
                tokens,
                wait_ms = %wait.as_millis(),
                "Waiting for all rate limit tiers"
            );
            sleep_or_cancel(wait.max(Duration::from_millis(1)), cancel).await?;
        }
    }

    /// Longest wait across all tiers.
    pub fn wait_time(&self, tokens: f64) -> Duration {
        self.lock_tiers()
            .values()
            .map(|bucket| bucket.wait_time(tokens))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn all_states(&self) -> BTreeMap<String, TokenBucketState> {
        self.lock_tiers()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.state()))
            .collect()
    }

    pub fn reset(&self) {
        for bucket in self.lock_tiers().values() {
            bucket.reset();
        }
    }
}
