use std::sync::Arc;
use std::time::Duration;

use forage_core::testutil::ScriptedOperation;
use forage_core::{HandleOptions, MultiTierTokenBucket, TokenBucket, TokenBucketConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{recording_handler, test_config};

#[tokio::test(start_paused = true)]
async fn bucket_paces_handled_requests() {
    let (handler, _sink) = recording_handler(test_config());
    let bucket = TokenBucket::per_second(2.0, Some(2.0)).unwrap();
    let cancel = CancellationToken::new();
    let op = ScriptedOperation::always(Ok(()));
    let start = Instant::now();

    for _ in 0..4 {
        bucket.consume(1.0, &cancel).await.unwrap();
        handler
            .handle(|| op.call(), HandleOptions::new("hackernews.item"))
            .await
            .unwrap();
    }

    // Burst of two, then one token every 500ms.
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert!(start.elapsed() < Duration::from_millis(1100));
    assert_eq!(op.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn slowest_tier_governs_multi_tier_waits() {
    let limiter = MultiTierTokenBucket::new();
    limiter
        .add_tier("second", TokenBucketConfig::new(10.0, 10.0))
        .unwrap();
    limiter
        .add_tier("minute", TokenBucketConfig::new(6.0, 6.0 / 60.0))
        .unwrap();
    let cancel = CancellationToken::new();
    let start = Instant::now();

    for _ in 0..7 {
        limiter.consume_all(1.0, &cancel).await.unwrap();
    }

    // Six immediately; the seventh waits ten seconds on the minute tier.
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn concurrent_consumers_never_overdraw() {
    let bucket = TokenBucket::new(TokenBucketConfig::new(3.0, 1.0)).unwrap();
    let cancel = CancellationToken::new();
    let served = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let bucket = bucket.clone();
        let cancel = cancel.clone();
        let served = served.clone();
        tasks.push(tokio::spawn(async move {
            bucket.consume(1.0, &cancel).await.unwrap();
            served.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            assert!(bucket.state().tokens >= -1e-9);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 6);
    let state = bucket.state();
    assert!((state.total_consumed - 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn cancelled_wait_returns_promptly() {
    let bucket = TokenBucket::per_hour(1.0, None).unwrap();
    let cancel = CancellationToken::new();
    bucket.consume(1.0, &cancel).await.unwrap();

    let waiter = {
        let bucket = bucket.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bucket.consume(1.0, &cancel).await })
    };
    cancel.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.code, "CANCELLED");
}

#[tokio::test(start_paused = true)]
async fn negative_and_nan_amounts_never_mint_tokens() {
    let bucket = TokenBucket::new(TokenBucketConfig::new(5.0, 1.0)).unwrap();
    let limiter = MultiTierTokenBucket::multi_tier(10.0, 60.0, 600.0).unwrap();
    let cancel = CancellationToken::new();

    for amount in [-100.0, f64::NAN] {
        assert!(!bucket.try_consume(amount));
        assert!(!bucket.can_handle_burst(amount));
        assert!(bucket.consume(amount, &cancel).await.is_err());
        assert!(!limiter.try_consume_all(amount));
        assert!(limiter.consume_all(amount, &cancel).await.is_err());
    }

    let state = bucket.state();
    assert!(state.tokens <= state.capacity);
    assert_eq!(state.tokens, 5.0);
    for (name, tier) in limiter.all_states() {
        assert!(tier.tokens <= tier.capacity, "{name}");
        assert_eq!(tier.total_consumed, 0.0, "{name}");
    }
}
