pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod degradation;
pub mod error;
pub mod handler;
pub mod notify;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod token_bucket;
pub mod util;

pub use cache::Memoized;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::ResilienceConfig;
pub use degradation::{DegradationConfig, DegradationTracker};
pub use error::{AppError, ErrorCategory, ErrorKind, ErrorSeverity, RecoveryStrategy};
pub use handler::{ErrorHandler, Guarded, HandleOptions, HandlerStats};
pub use notify::{NotificationConfig, NotificationLevel, NotificationSink, Notifier, TracingSink};
pub use retry::RetryConfig;
pub use token_bucket::{MultiTierTokenBucket, TokenBucket, TokenBucketConfig, TokenBucketState};
