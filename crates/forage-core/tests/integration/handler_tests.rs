use std::time::Duration;

use forage_core::testutil::ScriptedOperation;
use forage_core::{AppError, CircuitState, ErrorHandler, HandleOptions, NotificationLevel};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{recording_handler, test_config};

#[tokio::test(start_paused = true)]
async fn network_failures_open_breaker_then_half_open_recovers() {
    let (handler, _sink) = recording_handler(test_config());
    let failing = ScriptedOperation::<u32>::always(Err(AppError::network("connection reset")));

    // Primary call plus two retries; the last one trips the breaker.
    let err = handler
        .handle(|| failing.call(), HandleOptions::new("hackernews.item"))
        .await
        .unwrap_err();
    assert_eq!(err.code, "NETWORK_ERROR");
    assert_eq!(failing.calls(), 3);
    assert_eq!(handler.error_count("hackernews.item"), 3);

    let err = handler
        .handle(|| failing.call(), HandleOptions::new("hackernews.item"))
        .await
        .unwrap_err();
    assert_eq!(err.code, "CIRCUIT_BREAKER_OPEN");
    assert!(err.context.contains_key("retry_after_ms"));
    assert_eq!(failing.calls(), 3);

    let stats = handler.circuit_breaker_state("hackernews.item").unwrap();
    assert_eq!(stats.state, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;

    let healthy = ScriptedOperation::always(Ok(42u32));
    let value = handler
        .handle(|| healthy.call(), HandleOptions::new("hackernews.item"))
        .await
        .unwrap();
    assert_eq!(value, Some(42));

    let stats = handler.circuit_breaker_state("hackernews.item").unwrap();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_once_the_breaker_opens() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    let (handler, _sink) = recording_handler(config);
    let op = ScriptedOperation::<u32>::always(Err(AppError::from_status(503, "/v0/item/1.json", None)));

    let err = handler
        .handle(|| op.call(), HandleOptions::new("hackernews.item"))
        .await
        .unwrap_err();

    assert_eq!(err.code, "CIRCUIT_BREAKER_OPEN");
    assert_eq!(op.calls(), 1);
    let stats = handler.circuit_breaker_state("hackernews.item").unwrap();
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn every_failed_retry_is_counted() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 10;
    let (handler, _sink) = recording_handler(config);
    let op = ScriptedOperation::<u32>::always(Err(AppError::from_status(503, "/v0/item/1.json", None)));

    let err = handler
        .handle(
            || op.call(),
            HandleOptions::new("hackernews.item").service("hackernews"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, "HTTP_SERVER_ERROR");
    assert_eq!(op.calls(), 3);
    assert_eq!(handler.error_count("hackernews"), 3);
    let stats = handler.circuit_breaker_state("hackernews.item").unwrap();
    assert_eq!(stats.failure_count, 3);
    assert_eq!(stats.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_half_open_trial_does_not_wedge_the_breaker() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    let (handler, _sink) = recording_handler(config);
    let options = || HandleOptions::new("reddit.listing").service("reddit");

    let rejected = ScriptedOperation::<u32>::always(Err(AppError::from_status(400, "/r/x", None)));
    handler.handle(|| rejected.call(), options()).await.unwrap_err();
    assert_eq!(
        handler.circuit_breaker_state("reddit.listing").unwrap().state,
        CircuitState::Open
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    let cancelled = ScriptedOperation::<u32>::always(Err(AppError::cancelled()));
    let err = handler.handle(|| cancelled.call(), options()).await.unwrap_err();
    assert_eq!(err.code, "CANCELLED");

    let stats = handler.circuit_breaker_state("reddit.listing").unwrap();
    assert_eq!(stats.state, CircuitState::HalfOpen);
    assert_eq!(stats.half_open_attempts, 0);

    tokio::time::advance(Duration::from_secs(3600)).await;
    let healthy = ScriptedOperation::always(Ok(5u32));
    let value = handler.handle(|| healthy.call(), options()).await.unwrap();
    assert_eq!(value, Some(5));
    assert_eq!(
        handler.circuit_breaker_state("reddit.listing").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn cancellation_never_degrades_a_service() {
    let (handler, sink) = recording_handler(test_config());
    let op = ScriptedOperation::<u32>::always(Err(AppError::cancelled()));

    for _ in 0..8 {
        let err = handler
            .handle(
                || op.call(),
                HandleOptions::new("hackernews.item").service("hackernews"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "CANCELLED");
    }

    assert_eq!(op.calls(), 8);
    assert_eq!(handler.error_count("hackernews"), 0);
    assert!(handler.degraded_services().is_empty());
    assert!(sink.messages().is_empty());
    let stats = handler.circuit_breaker_state("hackernews.item").unwrap();
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_backs_off_and_succeeds() {
    let (handler, _sink) = recording_handler(test_config());
    let op = ScriptedOperation::sequence(vec![
        Err(AppError::rate_limited(Some(Duration::from_secs(2)))),
        Ok("page"),
    ]);

    let value = handler
        .handle(|| op.call(), HandleOptions::new("reddit.listing"))
        .await
        .unwrap();

    assert_eq!(value, Some("page"));
    assert_eq!(op.calls(), 2);
    assert_eq!(handler.error_count("reddit.listing"), 0);
}

#[tokio::test]
async fn cancellation_aborts_backoff() {
    let cancel = CancellationToken::new();
    let handler = ErrorHandler::new(test_config()).with_cancellation(cancel.clone());
    cancel.cancel();

    let op = ScriptedOperation::<u32>::always(Err(AppError::from_status(503, "/v0/item/1.json", None)));
    let err = handler
        .handle(|| op.call(), HandleOptions::new("hackernews.item"))
        .await
        .unwrap_err();

    assert_eq!(err.code, "CANCELLED");
    // Primary call and the first backoff attempt; the sleep never happens.
    assert_eq!(op.calls(), 2);
}

#[tokio::test]
async fn degradation_lifecycle_is_notified() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 10;
    let (handler, sink) = recording_handler(config);
    let op = ScriptedOperation::sequence(vec![
        Err(AppError::from_status(403, "/r/rust/hot.json", None)),
        Err(AppError::from_status(403, "/r/rust/hot.json", None)),
        Err(AppError::from_status(403, "/r/rust/hot.json", None)),
        Ok(vec!["post"]),
    ]);
    let options = || HandleOptions::new("reddit.listing").service("reddit");

    for _ in 0..3 {
        handler.handle(|| op.call(), options()).await.unwrap_err();
    }
    assert_eq!(handler.degraded_services(), vec!["reddit"]);
    assert!(sink.messages().iter().any(|(m, level)| {
        m.contains("Service 'reddit' degraded") && *level == NotificationLevel::Warning
    }));

    let value = handler.handle(|| op.call(), options()).await.unwrap();
    assert_eq!(value, Some(vec!["post"]));
    assert!(handler.degraded_services().is_empty());
    assert!(sink.contains("Service 'reddit' restored"));
}

#[tokio::test]
async fn degraded_service_short_circuits_to_fallback() {
    let (handler, _sink) = recording_handler(test_config());
    let op = ScriptedOperation::<String>::always(Err(AppError::parsing("unexpected token")));
    let options = || {
        HandleOptions::new("hackernews.stories")
            .service("hackernews")
            .fallback(|| "stale".to_string())
    };

    // Parsing errors fall back immediately but still count toward degradation.
    for _ in 0..3 {
        let value = handler.handle(|| op.call(), options()).await.unwrap();
        assert_eq!(value.as_deref(), Some("stale"));
    }
    assert_eq!(op.calls(), 3);

    let value = handler.handle(|| op.call(), options()).await.unwrap();
    assert_eq!(value.as_deref(), Some("stale"));
    assert_eq!(op.calls(), 3);
}

#[tokio::test]
async fn stats_serialize_for_monitoring() {
    let (handler, _sink) = recording_handler(test_config());
    let op = ScriptedOperation::<u32>::always(Err(AppError::validation("bad subreddit")));

    handler
        .handle(
            || op.call(),
            HandleOptions::new("reddit.listing").metadata("subreddit", "!!"),
        )
        .await
        .unwrap_err();

    let stats = serde_json::to_value(handler.stats()).unwrap();
    assert_eq!(stats["circuit_breakers"][0]["name"], "reddit.listing");
    assert_eq!(stats["circuit_breakers"][0]["state"], "CLOSED");
    assert_eq!(stats["error_counts"]["reddit.listing"], 1);
}
