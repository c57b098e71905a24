//! Reddit client for the public `.json` listing endpoints.

use std::sync::Arc;

use chrono::DateTime;
use forage_core::{AppError, ErrorHandler, ErrorKind, HandleOptions, TokenBucket};
use futures::future::BoxFuture;
use serde::Deserialize;
use url::Url;

use crate::http::{DEFAULT_TIMEOUT, JsonClient};
use crate::models::{Platform, Post, RedditSort};

pub const DEFAULT_BASE_URL: &str = "https://www.reddit.com";

/// Reddit caps listing pages at 100 entries.
pub const MAX_LIMIT: u32 = 100;

const SERVICE: &str = "reddit";

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    kind: String,
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    id: String,
    title: String,
    url: Option<String>,
    author: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: u64,
    created_utc: f64,
}

impl RedditPost {
    fn into_post(self) -> Option<Post> {
        let secs = self.created_utc.trunc() as i64;
        let nanos = (self.created_utc.fract() * 1e9) as u32;
        Some(Post {
            platform: Platform::Reddit,
            id: self.id,
            title: self.title,
            url: self.url.filter(|u| !u.is_empty()),
            author: self.author.filter(|a| a != "[deleted]"),
            score: self.score,
            comment_count: self.num_comments,
            created_at: DateTime::from_timestamp(secs, nanos)?,
        })
    }
}

/// Check a subreddit name: 2 to 21 ASCII letters, digits, or underscores.
pub fn validate_subreddit(name: &str) -> Result<(), AppError> {
    let valid = (2..=21).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::new(
            ErrorKind::Validation {
                field: Some("subreddit".to_string()),
            },
            format!("Invalid subreddit name '{name}'"),
        ))
    }
}

/// Rate-limited Reddit client.
///
/// Unauthenticated access is limited to roughly 60 requests per minute, so
/// the default bucket allows that with a burst of 10.
pub struct RedditClient {
    http: JsonClient,
    handler: Arc<ErrorHandler>,
    bucket: TokenBucket,
}

impl RedditClient {
    pub fn new(handler: Arc<ErrorHandler>) -> Result<Self, AppError> {
        Self::with_base_url(handler, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(handler: Arc<ErrorHandler>, base_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: JsonClient::new(base_url, DEFAULT_TIMEOUT)?,
            handler,
            bucket: TokenBucket::per_minute(60.0, Some(10.0))?,
        })
    }

    pub fn with_bucket(mut self, bucket: TokenBucket) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Posts of a subreddit listing. `limit` is clamped to `1..=100`.
    pub async fn listing(
        &self,
        subreddit: &str,
        sort: RedditSort,
        limit: u32,
    ) -> Result<Vec<Post>, AppError> {
        validate_subreddit(subreddit)?;
        let limit = limit.clamp(1, MAX_LIMIT);
        let url = self
            .http
            .endpoint(&format!("/r/{subreddit}/{sort}.json?limit={limit}"))?;

        let options = HandleOptions::new("reddit.listing")
            .service(SERVICE)
            .metadata("subreddit", subreddit)
            .metadata("sort", sort.as_str());

        let listing = self.handler.handle(self.request(&url), options).await?;

        let Some(listing) = listing else {
            return Ok(Vec::new());
        };
        let posts: Vec<Post> = listing
            .data
            .children
            .into_iter()
            .filter(|child| child.kind == "t3")
            .filter_map(|child| child.data.into_post())
            .collect();
        tracing::debug!(subreddit = %subreddit, sort = %sort, count = posts.len(), "Fetched listing");
        Ok(posts)
    }

    fn request<'a>(&'a self, url: &'a Url) -> impl Fn() -> BoxFuture<'a, Result<Listing, AppError>> + 'a {
        let cancel = self.handler.cancellation_token();
        move || {
            Box::pin(async move {
                self.bucket.consume(1.0, cancel).await?;
                self.http.get_json::<Listing>(url).await
            })
        }
    }
}
