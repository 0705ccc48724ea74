//! Status and job history commands

use crate::config::Config;
use crate::error::Result;
use crate::meta::{JobRecord, JobStore, MetaDb};
use crate::pipeline::{DownloadStatistics, Downloader};
use crate::state::ProcessingStatus;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub archive_url: String,
    pub statistics: DownloadStatistics,
    pub filings_stored: u64,
    pub tickers: u64,
}

/// Record counts for the configured kinds plus table sizes
pub async fn cmd_status(config: &Config, db: &MetaDb, downloader: &Downloader) -> Result<StatusInfo> {
    info!("Getting status");

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        archive_url: config.archive.base_url.clone(),
        statistics: downloader.get_statistics().await?,
        filings_stored: db.count_filings().await?,
        tickers: db.count_tickers().await?,
    })
}

pub async fn cmd_jobs(db: &MetaDb, limit: usize) -> Result<Vec<JobRecord>> {
    db.recent_jobs(limit).await
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 filingsync Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!("Archive: {}", status.archive_url);
    println!("Kinds: {}", status.statistics.kinds.join(", "));

    println!("\nProcessing records:");
    for state in ProcessingStatus::ALL {
        println!("  {:<12} {}", state.as_str(), status.statistics.counts.get(state));
    }
    println!("  {:<12} {}", "total", status.statistics.total);

    println!("\nFilings stored: {}", status.filings_stored);
    println!("Tickers: {}", status.tickers);
}

pub fn print_jobs(jobs: &[JobRecord]) {
    if jobs.is_empty() {
        println!("No download jobs recorded yet.");
        return;
    }

    println!("\n🗂  Recent download jobs\n");
    for job in jobs {
        println!("• {} [{}] {}", job.kind, job.status, job.id);
        println!(
            "  Started: {}  Finished: {}",
            job.started_at,
            job.completed_at.as_deref().unwrap_or("-")
        );
        println!("  Processed: {}/{}", job.files_downloaded, job.total_files);
        if let Some(error) = &job.error {
            println!("  Error: {}", error);
        }
    }
}
