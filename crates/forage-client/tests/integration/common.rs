use std::sync::Arc;
use std::time::Duration;

use forage_core::{
    CircuitBreakerConfig, DegradationConfig, ErrorHandler, ResilienceConfig, RetryConfig,
};

/// Handler with millisecond backoff so retry paths finish quickly.
pub fn fast_handler() -> Arc<ErrorHandler> {
    Arc::new(ErrorHandler::new(ResilienceConfig {
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 10,
            ..Default::default()
        },
        degradation: DegradationConfig {
            auto_recover: false,
            ..Default::default()
        },
        ..Default::default()
    }))
}
