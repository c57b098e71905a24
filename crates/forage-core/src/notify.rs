//! Operator notifications for degradation, recovery, and severe errors.
//!
//! Notifications are decoupled from delivery through [`NotificationSink`];
//! the default [`TracingSink`] forwards them to `tracing`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{AppError, ErrorSeverity};

/// Urgency of a notification. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Critical => "critical",
        }
    }

    pub fn from_severity(severity: ErrorSeverity) -> Self {
        match severity {
            ErrorSeverity::Low => NotificationLevel::Info,
            ErrorSeverity::Medium => NotificationLevel::Warning,
            ErrorSeverity::High => NotificationLevel::Error,
            ErrorSeverity::Critical => NotificationLevel::Critical,
        }
    }
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NotificationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(NotificationLevel::Info),
            "warning" | "warn" => Ok(NotificationLevel::Warning),
            "error" => Ok(NotificationLevel::Error),
            "critical" => Ok(NotificationLevel::Critical),
            _ => Err(format!("Unknown notification level: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Error and recovery notices below this level are dropped.
    /// `Error` and `Critical` notices always pass.
    pub min_level: NotificationLevel,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_level: NotificationLevel::Warning,
        }
    }
}

/// Receives notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, level: NotificationLevel);
}

/// Sink that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, message: &str, level: NotificationLevel) {
        match level {
            NotificationLevel::Info => tracing::info!(notification = %level, "{message}"),
            NotificationLevel::Warning => tracing::warn!(notification = %level, "{message}"),
            NotificationLevel::Error | NotificationLevel::Critical => {
                tracing::error!(notification = %level, "{message}")
            }
        }
    }
}

/// Sink backed by a closure.
pub struct FnSink<F>(pub F);

impl<F> NotificationSink for FnSink<F>
where
    F: Fn(&str, NotificationLevel) + Send + Sync,
{
    fn notify(&self, message: &str, level: NotificationLevel) {
        (self.0)(message, level)
    }
}

/// Applies [`NotificationConfig`] before handing notices to a sink.
#[derive(Clone)]
pub struct Notifier {
    config: NotificationConfig,
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(config: NotificationConfig, sink: Arc<dyn NotificationSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Severity-scaled notice for a failed operation.
    pub fn error(&self, operation: &str, error: &AppError) {
        let level = NotificationLevel::from_severity(error.severity);
        self.filtered(
            &format!("{} error in '{operation}': {error}", error.category),
            level,
        );
    }

    /// Low-urgency notice about a recovery attempt (retry, fallback, ...).
    pub fn recovery(&self, message: &str) {
        self.filtered(message, NotificationLevel::Info);
    }

    /// Service lifecycle notice (degraded, restored). Not level-filtered.
    pub fn service(&self, message: &str, level: NotificationLevel) {
        if self.config.enabled {
            self.sink.notify(message, level);
        }
    }

    fn filtered(&self, message: &str, level: NotificationLevel) {
        if !self.config.enabled {
            return;
        }
        if level >= NotificationLevel::Error || level >= self.config.min_level {
            self.sink.notify(message, level);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(NotificationConfig::default(), Arc::new(TracingSink))
    }
}
