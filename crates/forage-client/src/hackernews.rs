//! Hacker News client for the public Firebase API.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use forage_core::{
    AppError, ErrorHandler, ErrorKind, HandleOptions, Memoized, MultiTierTokenBucket,
};
use futures::{StreamExt, stream};
use serde::Deserialize;

use crate::http::{DEFAULT_TIMEOUT, JsonClient};
use crate::models::{Platform, Post, StoryList};

pub const DEFAULT_BASE_URL: &str = "https://hacker-news.firebaseio.com";

const SERVICE: &str = "hackernews";
const ITEM_CACHE_CAPACITY: u64 = 10_000;
const ITEM_CACHE_TTL: Duration = Duration::from_secs(300);
const ITEM_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
struct HnItem {
    id: u64,
    #[serde(rename = "type")]
    item_type: Option<String>,
    by: Option<String>,
    time: Option<i64>,
    title: Option<String>,
    url: Option<String>,
    score: Option<i64>,
    descendants: Option<u64>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    dead: bool,
}

impl HnItem {
    /// Live stories and jobs with a title; comments, polls, and removed
    /// items are skipped.
    fn into_post(self) -> Option<Post> {
        if self.deleted || self.dead {
            return None;
        }
        if !matches!(self.item_type.as_deref(), Some("story") | Some("job")) {
            return None;
        }
        Some(Post {
            platform: Platform::HackerNews,
            id: self.id.to_string(),
            title: self.title?,
            url: self.url,
            author: self.by,
            score: self.score.unwrap_or(0),
            comment_count: self.descendants.unwrap_or(0),
            created_at: DateTime::from_timestamp(self.time?, 0)?,
        })
    }
}

/// Rate-limited Hacker News client.
///
/// Every request draws from a multi-tier limiter and runs through the shared
/// [`ErrorHandler`] under the `hackernews` service.
pub struct HackerNewsClient {
    http: JsonClient,
    handler: Arc<ErrorHandler>,
    limiter: MultiTierTokenBucket,
    items: Memoized<u64, Option<Post>>,
}

impl HackerNewsClient {
    pub fn new(handler: Arc<ErrorHandler>) -> Result<Self, AppError> {
        Self::with_base_url(handler, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(handler: Arc<ErrorHandler>, base_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: JsonClient::new(base_url, DEFAULT_TIMEOUT)?,
            handler,
            limiter: MultiTierTokenBucket::multi_tier(10.0, 300.0, 10_000.0)?,
            items: Memoized::new(ITEM_CACHE_CAPACITY, ITEM_CACHE_TTL),
        })
    }

    pub fn with_limiter(mut self, limiter: MultiTierTokenBucket) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &MultiTierTokenBucket {
        &self.limiter
    }

    /// Story ids of a list, in ranking order.
    pub async fn story_ids(&self, list: StoryList) -> Result<Vec<u64>, AppError> {
        let url = self.http.endpoint(&format!("/v0/{list}stories.json"))?;
        let options = HandleOptions::new("hackernews.story_ids")
            .service(SERVICE)
            .metadata("list", list.as_str());

        let ids = self
            .handler
            .handle(self.request::<Vec<u64>>(&url), options)
            .await?;
        Ok(ids.unwrap_or_default())
    }

    /// A single item as a post; `None` if it does not exist or is not a
    /// live story. Results are cached for five minutes.
    pub async fn item(&self, id: u64) -> Result<Option<Post>, AppError> {
        self.items
            .get_or_try_insert(id, || self.fetch_item(id))
            .await
    }

    async fn fetch_item(&self, id: u64) -> Result<Option<Post>, AppError> {
        let url = self.http.endpoint(&format!("/v0/item/{id}.json"))?;
        let options = HandleOptions::new("hackernews.item")
            .service(SERVICE)
            .metadata("item_id", id);

        let item = self
            .handler
            .handle(self.request::<Option<HnItem>>(&url), options)
            .await?;
        Ok(item.flatten().and_then(HnItem::into_post))
    }

    /// Up to `limit` stories from a list, in ranking order.
    ///
    /// Items that fail to load are logged and skipped.
    pub async fn stories(&self, list: StoryList, limit: usize) -> Result<Vec<Post>, AppError> {
        let ids = self.story_ids(list).await?;
        tracing::debug!(list = %list, available = ids.len(), limit, "Fetching stories");

        let results: Vec<_> = stream::iter(ids.into_iter().take(limit))
            .map(|id| async move { (id, self.item(id).await) })
            .buffered(ITEM_CONCURRENCY)
            .collect()
            .await;

        let mut posts = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(Some(post)) => posts.push(post),
                Ok(None) => tracing::debug!(item_id = id, "Skipping non-story item"),
                Err(e) if matches!(e.kind, ErrorKind::Cancelled) => return Err(e),
                Err(e) => tracing::warn!(item_id = id, error = %e, "Failed to fetch item"),
            }
        }
        Ok(posts)
    }

    /// Rate-limited GET, re-run by the handler on retry.
    fn request<'a, T>(
        &'a self,
        url: &'a url::Url,
    ) -> impl Fn() -> futures::future::BoxFuture<'a, Result<T, AppError>> + 'a
    where
        T: serde::de::DeserializeOwned + Send + 'a,
    {
        let cancel = self.handler.cancellation_token();
        move || {
            Box::pin(async move {
                self.limiter.consume_all(1.0, cancel).await?;
                self.http.get_json::<T>(url).await
            })
        }
    }
}
