mod common;
mod handler_tests;
mod rate_limit_tests;
