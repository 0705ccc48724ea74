//! Sync commands: pull filings from one discovery source

use crate::archive::Quarter;
use crate::error::Result;
use crate::pipeline::{Downloader, JobProgress};
use crate::progress::ProgressDisplay;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What to sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Date(NaiveDate),
    Range { start: NaiveDate, end: NaiveDate },
    Latest { count: Option<usize> },
    Accession(String),
    Quarter(Quarter),
    History { start_year: Option<i32> },
}

impl std::fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTarget::Date(date) => write!(f, "date {}", date),
            SyncTarget::Range { start, end } => write!(f, "range {}..={}", start, end),
            SyncTarget::Latest { .. } => write!(f, "latest filings"),
            SyncTarget::Accession(accession) => write!(f, "accession {}", accession),
            SyncTarget::Quarter(quarter) => write!(f, "quarter {}", quarter),
            SyncTarget::History { .. } => write!(f, "history"),
        }
    }
}

/// Sync result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub target: String,
    /// Filings that reached COMPLETED during this run
    pub completed: u64,
    pub processed: u64,
    pub discovered: u64,
}

/// Run one sync. `history_start_year` fills in an unspecified history start.
pub async fn cmd_sync(
    downloader: &Downloader,
    target: SyncTarget,
    history_start_year: i32,
    show_progress: bool,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    info!("Syncing {}", target);

    let progress = JobProgress::new();
    let downloader = downloader.with_progress(progress.clone());
    let display = ProgressDisplay::start(progress.clone(), &target.to_string(), show_progress);

    let result = match &target {
        SyncTarget::Date(date) => downloader.download_for_date(*date, cancel).await,
        SyncTarget::Range { start, end } => {
            downloader.download_for_date_range(*start, *end, cancel).await
        }
        SyncTarget::Latest { count } => {
            let count = count.unwrap_or_else(|| downloader.latest_count());
            downloader.download_latest_filings(count, cancel).await
        }
        SyncTarget::Accession(accession) => downloader
            .download_by_accession(accession, cancel)
            .await
            .map(u64::from),
        SyncTarget::Quarter(quarter) => downloader.download_for_quarter(*quarter, cancel).await,
        SyncTarget::History { start_year } => {
            downloader
                .download_history(start_year.unwrap_or(history_start_year), cancel)
                .await
        }
    };

    if let Some(display) = display {
        display.finish(if result.is_ok() { "done" } else { "stopped" });
    }

    let snapshot = progress.snapshot();
    Ok(SyncReport {
        target: target.to_string(),
        completed: result?,
        processed: snapshot.processed,
        discovered: snapshot.total,
    })
}

pub fn print_sync_report(report: &SyncReport) {
    println!("\n✓ Sync of {} complete", report.target);
    println!("  Filings discovered: {}", report.discovered);
    println!("  Filings processed: {}", report.processed);
    println!("  Newly completed: {}", report.completed);
}
