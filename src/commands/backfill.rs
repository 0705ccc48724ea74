//! Backfill and gap inspection commands

use crate::error::Result;
use crate::pipeline::{BackfillStats, Downloader, JobProgress};
use crate::progress::ProgressDisplay;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Which window to backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillTarget {
    Range { start: NaiveDate, end: NaiveDate },
    Recent { days: u32 },
    /// The configured rolling window
    Auto,
}

pub async fn cmd_backfill(
    downloader: &Downloader,
    target: BackfillTarget,
    window_days: u32,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<BackfillStats> {
    let progress = JobProgress::new();
    let downloader = downloader.with_progress(progress.clone());
    let display = ProgressDisplay::start(progress, "Backfilling missing dates", show_progress);

    let result = match target {
        BackfillTarget::Range { start, end } => {
            downloader.backfill_date_range(start, end, cancel).await
        }
        BackfillTarget::Recent { days } => downloader.backfill_recent_days(days, cancel).await,
        BackfillTarget::Auto => downloader.auto_backfill(window_days, cancel).await,
    };

    if let Some(display) = display {
        display.finish("Backfill finished");
    }
    result
}

/// Dates without any recorded filing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingDates {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub dates: Vec<NaiveDate>,
}

pub async fn cmd_missing(
    downloader: &Downloader,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<MissingDates> {
    let dates = downloader.find_missing_dates(start, end).await?;
    Ok(MissingDates { start, end, dates })
}

pub fn print_backfill_stats(stats: &BackfillStats) {
    println!("\n✓ Backfill complete");
    println!("  Days in range: {}", stats.total_days);
    println!("  Missing days: {}", stats.missing_days);
    println!("  Days backfilled: {}", stats.backfilled_days);
    println!("  Filings completed: {}", stats.total_filings);
}

pub fn print_missing_dates(missing: &MissingDates) {
    if missing.dates.is_empty() {
        println!(
            "No gaps between {} and {}",
            missing.start, missing.end
        );
        return;
    }

    println!(
        "\n{} date(s) without filings between {} and {}:\n",
        missing.dates.len(),
        missing.start,
        missing.end
    );
    for date in &missing.dates {
        println!("  {} ({})", date, date.format("%a"));
    }
}
