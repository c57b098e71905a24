use std::sync::Arc;
use std::time::Duration;

use forage_core::testutil::RecordingSink;
use forage_core::{
    CircuitBreakerConfig, DegradationConfig, ErrorHandler, ResilienceConfig, RetryConfig,
};

/// Short, deterministic delays and a breaker that trips quickly.
pub fn test_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_secs(30),
            half_open_max_attempts: 1,
        },
        degradation: DegradationConfig {
            auto_recover: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Handler wired to a recording sink.
pub fn recording_handler(config: ResilienceConfig) -> (ErrorHandler, RecordingSink) {
    let sink = RecordingSink::new();
    let handler = ErrorHandler::with_sink(config, Arc::new(sink.clone()));
    (handler, sink)
}
