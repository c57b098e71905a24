use std::time::Duration;

use forage_client::http::USER_AGENT;
use forage_client::{Platform, RedditClient, RedditSort};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::fast_handler;

fn listing() -> serde_json::Value {
    json!({
        "kind": "Listing",
        "data": {
            "children": [
                {
                    "kind": "t3",
                    "data": {
                        "id": "1abc",
                        "title": "Async closures are stable",
                        "url": "https://blog.rust-lang.org/",
                        "author": "ferris",
                        "score": 420,
                        "num_comments": 69,
                        "created_utc": 1751000000.0
                    }
                },
                {
                    "kind": "t1",
                    "data": {
                        "id": "c1",
                        "title": "comment",
                        "created_utc": 1751000001.0
                    }
                }
            ]
        }
    })
}

#[tokio::test]
async fn listing_sends_user_agent_and_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/top.json"))
        .and(query_param("limit", "5"))
        .and(header("user-agent", USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
        .expect(1)
        .mount(&server)
        .await;

    let client = RedditClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let posts = client.listing("rust", RedditSort::Top, 5).await.unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].platform, Platform::Reddit);
    assert_eq!(posts[0].author.as_deref(), Some("ferris"));
    assert_eq!(posts[0].comment_count, 69);
}

#[tokio::test]
async fn invalid_subreddit_never_hits_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
        .expect(0)
        .mount(&server)
        .await;

    let client = RedditClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let err = client
        .listing("../../admin", RedditSort::Hot, 10)
        .await
        .unwrap_err();

    assert_eq!(err.code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/doesnotexist/hot.json"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = RedditClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let err = client
        .listing("doesnotexist", RedditSort::Hot, 25)
        .await
        .unwrap_err();

    assert_eq!(err.code, "HTTP_CLIENT_ERROR");
    assert_eq!(err.status_code(), Some(404));
    assert_eq!(err.context["subreddit"], "doesnotexist");
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/new.json"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .expect(3)
        .mount(&server)
        .await;

    let handler = fast_handler();
    let client = RedditClient::with_base_url(handler.clone(), &server.uri()).unwrap();
    let err = client.listing("rust", RedditSort::New, 10).await.unwrap_err();

    assert!(err.is_rate_limit());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    // Each of the three requests counts toward degradation.
    assert_eq!(handler.error_count("reddit"), 3);
    assert_eq!(handler.degraded_services(), vec!["reddit"]);
    let stats = handler.circuit_breaker_state("reddit.listing").unwrap();
    assert_eq!(stats.failure_count, 3);
}

#[tokio::test]
async fn repeated_forbidden_degrades_reddit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/hot.json"))
        .respond_with(ResponseTemplate::new(403))
        .expect(3)
        .mount(&server)
        .await;

    let handler = fast_handler();
    let client = RedditClient::with_base_url(handler.clone(), &server.uri()).unwrap();
    for _ in 0..3 {
        client.listing("rust", RedditSort::Hot, 10).await.unwrap_err();
    }

    assert_eq!(handler.degraded_services(), vec!["reddit"]);
    let stats = handler.circuit_breaker_state("reddit.listing").unwrap();
    assert_eq!(stats.failure_count, 3);
}
