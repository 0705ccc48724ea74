//! Retry, recovery and retention commands

use crate::error::Result;
use crate::pipeline::{CleanupStats, Downloader, JobProgress, RetryStats};
use crate::progress::ProgressDisplay;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn cmd_retry(
    downloader: &Downloader,
    max_retries: u32,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<RetryStats> {
    let progress = JobProgress::new();
    let downloader = downloader.with_progress(progress.clone());
    let display = ProgressDisplay::start(progress, "Retrying failed filings", show_progress);

    let result = downloader.retry_failed_with_stats(max_retries, cancel).await;
    if let Some(display) = display {
        display.finish("Retry pass finished");
    }
    result
}

/// Records moved back to FAILED
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverReport {
    pub recovered: u64,
    pub older_than_mins: u64,
}

pub async fn cmd_recover(downloader: &Downloader, older_than_mins: u64) -> Result<RecoverReport> {
    let recovered = downloader
        .recover_interrupted(Duration::from_secs(older_than_mins * 60))
        .await?;
    Ok(RecoverReport {
        recovered,
        older_than_mins,
    })
}

pub async fn cmd_cleanup(downloader: &Downloader, older_than_days: u32) -> Result<CleanupStats> {
    downloader.cleanup_older_than(older_than_days).await
}

pub fn print_retry_stats(stats: &RetryStats) {
    println!("\n✓ Retry pass complete");
    println!("  Eligible: {}", stats.eligible);
    println!("  Still backing off: {}", stats.deferred);
    println!("  Completed: {}", stats.batch.completed);
    println!("  Failed again: {}", stats.batch.failed);
}

pub fn print_recover_report(report: &RecoverReport) {
    println!(
        "✓ Recovered {} interrupted record(s) idle for at least {} minute(s)",
        report.recovered, report.older_than_mins
    );
}

pub fn print_cleanup_stats(stats: &CleanupStats, older_than_days: u32) {
    println!("\n✓ Removed data older than {} days", older_than_days);
    println!("  Processing records: {}", stats.records_deleted);
    println!("  Download jobs: {}", stats.jobs_deleted);
}
