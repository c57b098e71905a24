mod common;
mod hackernews_tests;
mod reddit_tests;
