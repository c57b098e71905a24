//! Shared HTTP plumbing: client construction, JSON fetching, and mapping of
//! transport and status failures onto [`AppError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use forage_core::{AppError, ErrorKind};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const USER_AGENT: &str = concat!(
    "forage/",
    env!("CARGO_PKG_VERSION"),
    " (forum scraper)"
);

/// Reddit sends the seconds until its window resets here.
const RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// JSON-over-HTTP client with a fixed base URL.
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl JsonClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            AppError::configuration("base_url", format!("Invalid base URL '{base_url}': {e}"))
        })?;
        match base_url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::configuration(
                    "base_url",
                    format!("URL scheme '{scheme}' is not allowed (only http/https)"),
                ));
            }
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::configuration("http_client", e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` (with optional query) against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::validation(format!("Invalid request path '{path}': {e}")))
    }

    /// GET `url` and decode the body as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, AppError> {
        let endpoint = url.path().to_string();

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_transport_error(&e, &endpoint, self.timeout))?;

        let response = check_status(response, &endpoint)?;

        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(&e, &endpoint, self.timeout))?;

        serde_json::from_str(&body).map_err(|e| {
            AppError::new(
                ErrorKind::Parsing {
                    source_name: Some(endpoint.clone()),
                },
                format!("Invalid JSON from {endpoint}: {e}"),
            )
        })
    }
}

fn check_status(response: Response, endpoint: &str) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = if status.as_u16() == 429 {
        retry_after_from_headers(response.headers(), Utc::now())
    } else {
        None
    };
    tracing::debug!(
        endpoint = %endpoint,
        status = status.as_u16(),
        retry_after_ms = ?retry_after.map(|d| d.as_millis()),
        "Non-success response"
    );
    Err(AppError::from_status(status.as_u16(), endpoint, retry_after))
}

/// Map a reqwest failure: timeouts and connection failures become retryable
/// network-category errors, body decoding problems become parsing errors.
pub fn map_transport_error(e: &reqwest::Error, endpoint: &str, timeout: Duration) -> AppError {
    if e.is_timeout() {
        return AppError::timeout(timeout).with_context("endpoint", endpoint);
    }
    if e.is_decode() {
        return AppError::new(
            ErrorKind::Parsing {
                source_name: Some(endpoint.to_string()),
            },
            format!("Failed to decode response from {endpoint}: {e}"),
        );
    }

    let message = if e.is_connect() {
        format!("Connection failed for {endpoint}: {e}")
    } else {
        format!("Request to {endpoint} failed: {e}")
    };
    AppError::new(
        ErrorKind::Network {
            status_code: None,
            endpoint: Some(endpoint.to_string()),
        },
        message,
    )
}

/// Server-requested wait from `Retry-After`, falling back to Reddit's
/// `x-ratelimit-reset`.
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now))
        .or_else(|| {
            headers
                .get(RATELIMIT_RESET)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_seconds)
        })
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Some(d) = parse_seconds(value) {
        return Some(d);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-5", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_ratelimit_reset_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(RATELIMIT_RESET, HeaderValue::from_static("42.0"));
        assert_eq!(
            retry_after_from_headers(&headers, Utc::now()),
            Some(Duration::from_secs(42))
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(
            retry_after_from_headers(&headers, Utc::now()),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let err = JsonClient::new("ftp://example.com", DEFAULT_TIMEOUT).unwrap_err();
        assert_eq!(err.code, "CONFIGURATION_ERROR");
        assert!(JsonClient::new("not a url", DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn test_endpoint_joins_base() {
        let client = JsonClient::new("https://hacker-news.firebaseio.com", DEFAULT_TIMEOUT).unwrap();
        let url = client.endpoint("/v0/item/8863.json").unwrap();
        assert_eq!(url.as_str(), "https://hacker-news.firebaseio.com/v0/item/8863.json");
    }
}
