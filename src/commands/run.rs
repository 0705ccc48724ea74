//! Scheduler daemon and ticker commands

use super::Services;
use crate::config::Config;
use crate::error::Result;
use crate::scheduler::{JobScheduler, JobSummary, TriggerOutcome};
use crate::tickers::TickerSync;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn build_scheduler(config: &Config, services: &Services) -> JobScheduler {
    let tickers = Arc::new(TickerSync::new(services.client.clone(), services.db.clone()));
    JobScheduler::from_config(config, services.downloader.clone(), tickers)
}

/// Run every enabled job on its interval until `cancel` fires. Jobs named
/// in `run_now` start immediately as well.
pub async fn cmd_run(
    config: &Config,
    services: &Services,
    run_now: &[String],
    cancel: CancellationToken,
) -> Result<Vec<JobSummary>> {
    let scheduler = build_scheduler(config, services);
    for name in run_now {
        let outcome = scheduler.trigger(name, &cancel)?;
        info!(job = %name, %outcome, "Manual trigger");
    }

    scheduler.run(cancel).await;
    Ok(scheduler.status())
}

/// Run one named job in the foreground
pub async fn cmd_trigger(
    config: &Config,
    services: &Services,
    name: &str,
    cancel: &CancellationToken,
) -> Result<TriggerOutcome> {
    build_scheduler(config, services).run_job(name, cancel).await
}

/// Ticker sync result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerReport {
    pub synced: usize,
    pub total: u64,
}

pub async fn cmd_tickers(services: &Services, cancel: &CancellationToken) -> Result<TickerReport> {
    let sync = TickerSync::new(services.client.clone(), services.db.clone());
    let synced = sync.sync(cancel).await?;
    Ok(TickerReport {
        synced,
        total: services.db.count_tickers().await?,
    })
}

pub fn print_job_summaries(jobs: &[JobSummary]) {
    println!("\nScheduled jobs:");
    for job in jobs {
        let state = if !job.enabled {
            "disabled"
        } else if job.running {
            "running"
        } else {
            "idle"
        };
        println!(
            "  {:<14} every {:>6}s  {:<8}  last run {}/{}",
            job.name, job.interval_secs, state, job.progress.processed, job.progress.total
        );
    }
}

pub fn print_ticker_report(report: &TickerReport) {
    println!(
        "✓ Synced {} ticker(s); {} stored in total",
        report.synced, report.total
    );
}
