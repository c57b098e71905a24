use forage_client::{HackerNewsClient, Platform, StoryList};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::fast_handler;

fn story(id: u64, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "story",
        "by": "alice",
        "time": 1_700_000_000 + id,
        "title": title,
        "url": format!("https://example.com/{id}"),
        "score": 10 * id,
        "descendants": id
    })
}

async fn mount_item(server: &MockServer, id: u64, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/v0/item/{id}.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn stories_keep_ranking_and_skip_missing_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/topstories.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([3, 1, 2, 4])))
        .expect(1)
        .mount(&server)
        .await;
    mount_item(&server, 1, story(1, "First")).await;
    mount_item(&server, 2, json!(null)).await;
    mount_item(&server, 3, story(3, "Third")).await;

    let client = HackerNewsClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let posts = client.stories(StoryList::Top, 3).await.unwrap();

    let titles: Vec<_> = posts.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Third", "First"]);
    assert!(posts.iter().all(|p| p.platform == Platform::HackerNews));
    assert_eq!(posts[0].score, 30);
}

#[tokio::test]
async fn server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/newstories.json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v0/newstories.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([42])))
        .expect(1)
        .mount(&server)
        .await;

    let handler = fast_handler();
    let client = HackerNewsClient::with_base_url(handler.clone(), &server.uri()).unwrap();
    let ids = client.story_ids(StoryList::New).await.unwrap();

    assert_eq!(ids, vec![42]);
    assert_eq!(handler.error_count("hackernews"), 0);
}

#[tokio::test]
async fn items_are_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/item/7.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(story(7, "Cached")))
        .expect(1)
        .mount(&server)
        .await;

    let client = HackerNewsClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let first = client.item(7).await.unwrap().unwrap();
    let second = client.item(7).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id, "7");
}

#[tokio::test]
async fn malformed_json_is_a_parsing_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v0/beststories.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = HackerNewsClient::with_base_url(fast_handler(), &server.uri()).unwrap();
    let err = client.story_ids(StoryList::Best).await.unwrap_err();

    assert_eq!(err.code, "PARSING_ERROR");
    assert_eq!(err.context["operation"], "hackernews.story_ids");
    assert_eq!(err.context["list"], "best");
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    // Nothing listens on the discard port.
    let client = HackerNewsClient::with_base_url(fast_handler(), "http://127.0.0.1:9").unwrap();
    let err = client.story_ids(StoryList::Top).await.unwrap_err();

    assert!(err.is_network(), "{err}");
    assert!(err.retryable);
}
