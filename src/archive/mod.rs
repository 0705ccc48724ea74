//! Upstream archive access
//!
//! This module provides:
//! - A shared request budget every fetch must pass through
//! - A client that sends the descriptive client identifier and detects blocks
//! - Daily and quarterly master index discovery
//! - The latest-filings feed

mod client;
mod crawler;
mod feed;
mod index;
mod rate_limit;

pub use client::*;
pub use crawler::*;
pub use feed::*;
pub use index::*;
pub use rate_limit::*;
