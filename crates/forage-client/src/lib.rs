pub mod hackernews;
pub mod http;
pub mod models;
pub mod reddit;

pub use hackernews::HackerNewsClient;
pub use models::{Platform, Post, RedditSort, StoryList};
pub use reddit::RedditClient;
