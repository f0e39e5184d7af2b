/// Helpers.
mod common;
/// Configuration discovery and loading tests.
mod config;
/// "Big picture" end-to-end tests: whole runs over fixture repositories,
/// checked through their reports and summaries.
mod e2e;
