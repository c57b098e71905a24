use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Forum a post was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Reddit,
    HackerNews,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::HackerNews => "hackernews",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission normalized across platforms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub platform: Platform,
    pub id: String,
    pub title: String,
    /// Link target; `None` for text posts without one.
    pub url: Option<String>,
    pub author: Option<String>,
    pub score: i64,
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Hacker News story list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoryList {
    #[default]
    Top,
    New,
    Best,
}

impl StoryList {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryList::Top => "top",
            StoryList::New => "new",
            StoryList::Best => "best",
        }
    }
}

impl fmt::Display for StoryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "top" => Ok(StoryList::Top),
            "new" => Ok(StoryList::New),
            "best" => Ok(StoryList::Best),
            _ => Err(format!("Unknown story list '{s}' (expected top, new or best)")),
        }
    }
}

/// Reddit listing sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedditSort {
    #[default]
    Hot,
    New,
    Top,
    Rising,
}

impl RedditSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedditSort::Hot => "hot",
            RedditSort::New => "new",
            RedditSort::Top => "top",
            RedditSort::Rising => "rising",
        }
    }
}

impl fmt::Display for RedditSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedditSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hot" => Ok(RedditSort::Hot),
            "new" => Ok(RedditSort::New),
            "top" => Ok(RedditSort::Top),
            "rising" => Ok(RedditSort::Rising),
            _ => Err(format!(
                "Unknown sort '{s}' (expected hot, new, top or rising)"
            )),
        }
    }
}
