//! Error taxonomy shared by every Forage component.
//!
//! Every failure is one [`AppError`] record: a common field set (category,
//! severity, retryability, suggested recovery strategy, accumulated context)
//! plus a kind-specific [`ErrorKind`] payload.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Retry-After used when a rate-limited response does not carry one.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Broad area an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Database,
    Validation,
    Configuration,
    Parsing,
    BusinessRule,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::BusinessRule => "business_rule",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How bad an error is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Response chosen for a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    Retry,
    ExponentialBackoff,
    CircuitBreaker,
    Fallback,
    Ignore,
    Terminate,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::ExponentialBackoff => "exponential_backoff",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Ignore => "ignore",
            RecoveryStrategy::Terminate => "terminate",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific payload of an [`AppError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or non-success HTTP status.
    Network {
        status_code: Option<u16>,
        endpoint: Option<String>,
    },
    /// The remote API told us to slow down (HTTP 429).
    RateLimit {
        retry_after: Option<Duration>,
        endpoint: Option<String>,
    },
    /// The operation did not finish in time.
    Timeout { after: Option<Duration> },
    /// Rejected by an open circuit breaker without running the operation.
    CircuitOpen { operation: String },
    /// A wait was aborted through a cancellation token.
    Cancelled,
    Database { operation: Option<String> },
    Validation { field: Option<String> },
    Configuration { key: Option<String> },
    Parsing { source_name: Option<String> },
    BusinessRule { rule: Option<String> },
    /// Anything that could not be classified further.
    Unknown,
}

struct KindDefaults {
    code: &'static str,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    strategy: Option<RecoveryStrategy>,
}

impl ErrorKind {
    fn defaults(&self) -> KindDefaults {
        use ErrorCategory as C;
        use ErrorSeverity as S;
        use RecoveryStrategy as R;

        let (code, category, severity, retryable, strategy) = match self {
            ErrorKind::Network {
                status_code: Some(status),
                ..
            } if *status >= 500 => (
                "HTTP_SERVER_ERROR",
                C::Network,
                S::High,
                true,
                Some(R::ExponentialBackoff),
            ),
            ErrorKind::Network {
                status_code: Some(status),
                ..
            } if *status >= 400 => (
                "HTTP_CLIENT_ERROR",
                C::Network,
                S::Medium,
                false,
                Some(R::Terminate),
            ),
            ErrorKind::Network { .. } => ("NETWORK_ERROR", C::Network, S::Medium, true, None),
            ErrorKind::RateLimit { .. } => (
                "RATE_LIMIT_EXCEEDED",
                C::Network,
                S::Medium,
                true,
                Some(R::ExponentialBackoff),
            ),
            ErrorKind::Timeout { .. } => ("TIMEOUT", C::Network, S::Medium, true, None),
            ErrorKind::CircuitOpen { .. } => {
                ("CIRCUIT_BREAKER_OPEN", C::Network, S::Medium, false, None)
            }
            ErrorKind::Cancelled => ("CANCELLED", C::Network, S::Low, false, Some(R::Terminate)),
            ErrorKind::Database { .. } => {
                ("DATABASE_ERROR", C::Database, S::High, true, Some(R::Retry))
            }
            ErrorKind::Validation { .. } => (
                "VALIDATION_ERROR",
                C::Validation,
                S::Low,
                false,
                Some(R::Terminate),
            ),
            ErrorKind::Configuration { .. } => (
                "CONFIGURATION_ERROR",
                C::Configuration,
                S::Critical,
                false,
                Some(R::Terminate),
            ),
            ErrorKind::Parsing { .. } => (
                "PARSING_ERROR",
                C::Parsing,
                S::Medium,
                false,
                Some(R::Fallback),
            ),
            ErrorKind::BusinessRule { .. } => (
                "BUSINESS_RULE_VIOLATION",
                C::BusinessRule,
                S::Medium,
                false,
                Some(R::Terminate),
            ),
            ErrorKind::Unknown => ("UNKNOWN_ERROR", C::BusinessRule, S::Medium, false, None),
        };

        KindDefaults {
            code,
            category,
            severity,
            retryable,
            strategy,
        }
    }
}

/// Application-wide error record for Forage.
#[derive(Error, Debug, Clone, Serialize)]
#[error("[{code}] {message}")]
pub struct AppError {
    pub message: String,
    pub code: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Accumulated key/value pairs; see [`AppError::add_context`].
    pub context: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ErrorKind,
}

impl AppError {
    /// Build an error of the given kind with the kind's default classification.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let defaults = kind.defaults();
        Self {
            message: message.into(),
            code: defaults.code.to_string(),
            category: defaults.category,
            severity: defaults.severity,
            retryable: defaults.retryable,
            recovery_strategy: defaults.strategy,
            context: BTreeMap::new(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network {
                status_code: None,
                endpoint: None,
            },
            message,
        )
    }

    /// Classify a non-success HTTP response.
    ///
    /// 429 becomes a rate-limit error, 5xx a retryable network error, any
    /// other status a non-retryable one.
    pub fn from_status(
        status: u16,
        endpoint: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let endpoint = endpoint.into();
        if status == 429 {
            let mut err = Self::rate_limited(retry_after);
            err.kind = ErrorKind::RateLimit {
                retry_after,
                endpoint: Some(endpoint.clone()),
            };
            err.message = format!("HTTP 429 for {endpoint}");
            return err;
        }
        Self::new(
            ErrorKind::Network {
                status_code: Some(status),
                endpoint: Some(endpoint.clone()),
            },
            format!("HTTP {status} for {endpoint}"),
        )
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        let message = match retry_after {
            Some(d) => format!("Rate limit exceeded, retry after {}ms", d.as_millis()),
            None => "Rate limit exceeded".to_string(),
        };
        Self::new(
            ErrorKind::RateLimit {
                retry_after,
                endpoint: None,
            },
            message,
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout { after: Some(after) },
            format!("Request timed out after {}ms", after.as_millis()),
        )
    }

    pub fn circuit_open(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorKind::CircuitOpen {
                operation: operation.clone(),
            },
            format!("Circuit breaker is open for operation '{operation}'"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database { operation: None }, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation { field: None }, message)
    }

    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration {
                key: Some(key.into()),
            },
            message,
        )
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing { source_name: None }, message)
    }

    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::BusinessRule {
                rule: Some(rule.into()),
            },
            message,
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_strategy(mut self, strategy: Option<RecoveryStrategy>) -> Self {
        self.recovery_strategy = strategy;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merge fields into the context. Existing keys not present in `fields`
    /// are kept; same-named keys are overwritten.
    pub fn add_context<I, K, V>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in fields {
            self.context.insert(key.into(), value.into());
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            ErrorKind::Network { status_code, .. } => *status_code,
            ErrorKind::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    /// Server-provided Retry-After, only present on rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.kind {
            ErrorKind::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self.kind, ErrorKind::RateLimit { .. })
    }

    pub fn is_network(&self) -> bool {
        self.category == ErrorCategory::Network
            && !matches!(
                self.kind,
                ErrorKind::Cancelled | ErrorKind::CircuitOpen { .. }
            )
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }

    /// Normalize any error into an [`AppError`].
    ///
    /// An `AppError` anywhere in the source chain is returned as-is; I/O and
    /// JSON errors map to their kinds; anything else is classified from its
    /// message.
    pub fn from_unknown(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(app) = e.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                return Self::from_io(io);
            }
            if let Some(json) = e.downcast_ref::<serde_json::Error>() {
                return Self::parsing(format!("Invalid JSON: {json}"));
            }
            if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return Self::new(ErrorKind::Timeout { after: None }, e.to_string());
            }
            current = e.source();
        }
        Self::from_message(&err.to_string())
    }

    /// Classify a bare error message.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("too many requests") || lower.contains("rate limit") {
            return Self::new(
                ErrorKind::RateLimit {
                    retry_after: None,
                    endpoint: None,
                },
                message,
            );
        }

        if let Some(status) = extract_status(&lower) {
            if status == 429 {
                return Self::new(
                    ErrorKind::RateLimit {
                        retry_after: None,
                        endpoint: None,
                    },
                    message,
                );
            }
            return Self::new(
                ErrorKind::Network {
                    status_code: Some(status),
                    endpoint: None,
                },
                message,
            );
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return Self::new(ErrorKind::Timeout { after: None }, message);
        }

        const NETWORK_MARKERS: &[&str] = &[
            "econnreset",
            "econnrefused",
            "enotfound",
            "connection reset",
            "connection refused",
            "connection closed",
            "network",
            "socket",
            "dns",
        ];
        if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::network(message);
        }

        Self::unknown(message)
    }

    fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::TimedOut => Self::new(ErrorKind::Timeout { after: None }, err.to_string()),
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof => Self::network(err.to_string()),
            Io::InvalidData | Io::InvalidInput => Self::parsing(err.to_string()),
            _ => Self::unknown(err.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::parsing(format!("Invalid JSON: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout { after: None }, err.to_string())
    }
}

/// Whether an error is worth retrying.
///
/// Breaker rejections and cancellations are never retried, whatever their
/// `retryable` flag says.
pub fn is_retryable_error(err: &AppError) -> bool {
    match err.kind {
        ErrorKind::Cancelled | ErrorKind::CircuitOpen { .. } => false,
        _ => err.retryable,
    }
}

/// Find an HTTP status in messages like "HTTP 503" or "status: 429".
fn extract_status(lower: &str) -> Option<u16> {
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == ':' || c == '=')
        .filter(|w| !w.is_empty())
        .collect();

    words.windows(2).find_map(|pair| {
        let marker = pair[0];
        if !matches!(marker, "http" | "status" | "code") {
            return None;
        }
        let digits: String = pair[1].chars().take_while(|c| c.is_ascii_digit()).collect();
        digits
            .parse::<u16>()
            .ok()
            .filter(|s| (400..=599).contains(s))
    })
}
