//! filingsync - ingests disclosure-archive filings into a local SQLite store
//!
//! This crate provides:
//! - A shared, strictly bounded request budget for the upstream archive
//! - Discovery through daily and quarterly master indexes and the latest feed
//! - A per-filing processing state machine that makes re-runs idempotent
//! - Retry with backoff, gap backfill, and a singleflight job scheduler

pub mod archive;
pub mod commands;
pub mod config;
pub mod error;
pub mod filing;
pub mod meta;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod tickers;

pub use config::Config;
pub use error::{Error, Result};
