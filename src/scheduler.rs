//! Named background jobs with singleflight execution
//!
//! Each job runs on its own interval and can also be triggered on demand.
//! A job never overlaps itself: the running flag is taken with a single
//! compare-and-swap before the run starts and released by a guard when the
//! run ends, whatever its outcome.

use crate::config::{Config, JobConfig};
use crate::error::{Error, Result};
use crate::pipeline::{Downloader, JobProgress, ProgressSnapshot};
use crate::tickers::TickerSync;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Work performed by one scheduled job
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, progress: Arc<JobProgress>, cancel: &CancellationToken) -> Result<()>;
}

/// Result of asking a job to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
    Disabled,
}

impl std::fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerOutcome::Started => write!(f, "started"),
            TriggerOutcome::AlreadyRunning => write!(f, "already running"),
            TriggerOutcome::Disabled => write!(f, "disabled"),
        }
    }
}

/// Point-in-time view of a job for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub enabled: bool,
    pub interval_secs: u64,
    pub running: bool,
    pub progress: ProgressSnapshot,
}

struct ScheduledJob {
    name: &'static str,
    config: JobConfig,
    running: AtomicBool,
    progress: Arc<JobProgress>,
    runner: Arc<dyn JobRunner>,
}

/// Clears the running flag when dropped
struct RunningGuard(Arc<ScheduledJob>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

impl ScheduledJob {
    fn claim(self: &Arc<Self>) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(self.clone()))
    }

    /// Disabled jobs are refused before the flag is looked at
    fn admit(self: &Arc<Self>) -> std::result::Result<RunningGuard, TriggerOutcome> {
        if !self.config.enabled {
            debug!(job = self.name, "Job disabled; not starting");
            return Err(TriggerOutcome::Disabled);
        }
        self.claim().ok_or_else(|| {
            info!(job = self.name, "Job already running; skipping");
            TriggerOutcome::AlreadyRunning
        })
    }

    async fn execute(&self, cancel: &CancellationToken) {
        self.progress.reset();
        let started = Instant::now();
        info!(job = self.name, "Job started");

        match self.runner.run(self.progress.clone(), cancel).await {
            Ok(()) => {
                let progress = self.progress.snapshot();
                info!(
                    job = self.name,
                    processed = progress.processed,
                    total = progress.total,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
            }
            Err(Error::Cancelled) => info!(job = self.name, "Job cancelled"),
            Err(e) => error!(job = self.name, "Job failed: {}", e),
        }
    }
}

/// Registry of named jobs
#[derive(Default)]
pub struct JobScheduler {
    jobs: Vec<Arc<ScheduledJob>>,
    triggered: TaskTracker,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard jobs, configured from `[jobs.*]`
    pub fn from_config(config: &Config, downloader: Downloader, tickers: Arc<TickerSync>) -> Self {
        let jobs = &config.jobs;
        let mut scheduler = Self::new();
        scheduler.register(
            "sync-filings",
            &jobs.sync_filings,
            Arc::new(SyncFilingsJob {
                downloader: downloader.clone(),
            }),
        );
        scheduler.register("sync-tickers", &jobs.sync_tickers, Arc::new(SyncTickersJob { tickers }));
        scheduler.register(
            "retry-failed",
            &jobs.retry_failed,
            Arc::new(RetryFailedJob {
                downloader: downloader.clone(),
                max_retries: config.download.max_retries,
            }),
        );
        scheduler.register(
            "auto-backfill",
            &jobs.auto_backfill,
            Arc::new(AutoBackfillJob {
                downloader: downloader.clone(),
                window_days: config.backfill.window_days,
            }),
        );
        scheduler.register(
            "cleanup",
            &jobs.cleanup,
            Arc::new(CleanupJob {
                downloader,
                max_age_days: config.retention.max_age_days,
            }),
        );
        scheduler
    }

    pub fn register(&mut self, name: &'static str, config: &JobConfig, runner: Arc<dyn JobRunner>) {
        self.jobs.push(Arc::new(ScheduledJob {
            name,
            config: config.clone(),
            running: AtomicBool::new(false),
            progress: JobProgress::new(),
            runner,
        }));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name).collect()
    }

    fn job(&self, name: &str) -> Result<&Arc<ScheduledJob>> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))
    }

    /// Start a job in the background; returns without waiting for it.
    /// `run` waits for triggered runs before it returns.
    pub fn trigger(&self, name: &str, cancel: &CancellationToken) -> Result<TriggerOutcome> {
        let job = self.job(name)?;
        let guard = match job.admit() {
            Ok(guard) => guard,
            Err(outcome) => return Ok(outcome),
        };

        let cancel = cancel.clone();
        self.triggered.spawn(async move {
            let job = guard.0.clone();
            job.execute(&cancel).await;
            drop(guard);
        });
        Ok(TriggerOutcome::Started)
    }

    /// Run a job to completion in the caller's task
    pub async fn run_job(&self, name: &str, cancel: &CancellationToken) -> Result<TriggerOutcome> {
        let job = self.job(name)?;
        let _guard = match job.admit() {
            Ok(guard) => guard,
            Err(outcome) => return Ok(outcome),
        };
        job.execute(cancel).await;
        Ok(TriggerOutcome::Started)
    }

    pub fn status(&self) -> Vec<JobSummary> {
        self.jobs
            .iter()
            .map(|j| JobSummary {
                name: j.name.to_string(),
                enabled: j.config.enabled,
                interval_secs: j.config.interval_secs,
                running: j.running.load(Ordering::Acquire),
                progress: j.progress.snapshot(),
            })
            .collect()
    }

    /// Drive every enabled job on its interval until `cancel` fires, then
    /// wait for in-flight runs to wind down
    pub async fn run(&self, cancel: CancellationToken) {
        let mut loops = Vec::new();
        for job in self.jobs.iter().filter(|j| j.config.enabled) {
            let job = job.clone();
            let cancel = cancel.clone();
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(job.config.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Ok(guard) = job.admit() {
                        job.execute(&cancel).await;
                        drop(guard);
                    }
                }
                debug!(job = job.name, "Job loop stopped");
            }));
        }

        info!(jobs = loops.len(), "Scheduler running");
        for handle in futures::future::join_all(loops).await {
            if let Err(e) = handle {
                error!("Job loop panicked: {}", e);
            }
        }

        if !self.triggered.is_empty() {
            info!(runs = self.triggered.len(), "Waiting for triggered runs");
        }
        self.triggered.close();
        self.triggered.wait().await;
        self.triggered.reopen();
        info!("Scheduler stopped");
    }
}

// ===== Standard jobs =====

/// Previous and current day's daily indexes, then the latest feed
struct SyncFilingsJob {
    downloader: Downloader,
}

#[async_trait]
impl JobRunner for SyncFilingsJob {
    async fn run(&self, progress: Arc<JobProgress>, cancel: &CancellationToken) -> Result<()> {
        let downloader = self.downloader.with_progress(progress);
        let today = crate::archive::today();
        let yesterday = today - ChronoDuration::days(1);

        let from_index = downloader
            .download_for_date_range(yesterday, today, cancel)
            .await?;
        let from_feed = downloader
            .download_latest_filings(downloader.latest_count(), cancel)
            .await?;
        info!(from_index, from_feed, "Filing sync completed filings");
        Ok(())
    }
}

struct SyncTickersJob {
    tickers: Arc<TickerSync>,
}

#[async_trait]
impl JobRunner for SyncTickersJob {
    async fn run(&self, progress: Arc<JobProgress>, cancel: &CancellationToken) -> Result<()> {
        progress.add_total(1);
        self.tickers.sync(cancel).await?;
        progress.record_processed();
        Ok(())
    }
}

struct RetryFailedJob {
    downloader: Downloader,
    max_retries: u32,
}

#[async_trait]
impl JobRunner for RetryFailedJob {
    async fn run(&self, progress: Arc<JobProgress>, cancel: &CancellationToken) -> Result<()> {
        self.downloader
            .with_progress(progress)
            .retry_failed_downloads(self.max_retries, cancel)
            .await?;
        Ok(())
    }
}

struct AutoBackfillJob {
    downloader: Downloader,
    window_days: u32,
}

#[async_trait]
impl JobRunner for AutoBackfillJob {
    async fn run(&self, progress: Arc<JobProgress>, cancel: &CancellationToken) -> Result<()> {
        self.downloader
            .with_progress(progress)
            .auto_backfill(self.window_days, cancel)
            .await?;
        Ok(())
    }
}

/// Retention sweep. Also returns abandoned in-flight records to FAILED.
struct CleanupJob {
    downloader: Downloader,
    max_age_days: u32,
}

#[async_trait]
impl JobRunner for CleanupJob {
    async fn run(&self, _progress: Arc<JobProgress>, _cancel: &CancellationToken) -> Result<()> {
        self.downloader
            .recover_interrupted(std::time::Duration::from_secs(60 * 60))
            .await?;
        self.downloader.cleanup_older_than(self.max_age_days).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct BlockingRunner {
        calls: AtomicU32,
        entered: Notify,
        release: Notify,
        fail: bool,
    }

    #[async_trait]
    impl JobRunner for BlockingRunner {
        async fn run(&self, progress: Arc<JobProgress>, _cancel: &CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.add_total(2);
            progress.record_processed();
            self.entered.notify_one();
            self.release.notified().await;
            if self.fail {
                Err(Error::Other("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn scheduler_with(runner: Arc<BlockingRunner>, enabled: bool) -> JobScheduler {
        let mut scheduler = JobScheduler::new();
        scheduler.register(
            "sync-filings",
            &JobConfig {
                enabled,
                interval_secs: 3600,
            },
            runner,
        );
        scheduler
    }

    #[tokio::test]
    async fn test_singleflight() {
        let runner = Arc::new(BlockingRunner::default());
        let scheduler = Arc::new(scheduler_with(runner.clone(), true));
        let cancel = CancellationToken::new();

        let first = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run_job("sync-filings", &cancel).await })
        };
        runner.entered.notified().await;

        assert_eq!(
            scheduler.trigger("sync-filings", &cancel).unwrap(),
            TriggerOutcome::AlreadyRunning
        );
        assert_eq!(
            scheduler.run_job("sync-filings", &cancel).await.unwrap(),
            TriggerOutcome::AlreadyRunning
        );

        let status = &scheduler.status()[0];
        assert!(status.running);
        assert_eq!(status.progress, ProgressSnapshot { processed: 1, total: 2 });

        runner.release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), TriggerOutcome::Started);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.status()[0].running);
    }

    #[tokio::test]
    async fn test_flag_cleared_after_failure() {
        let runner = Arc::new(BlockingRunner {
            fail: true,
            ..BlockingRunner::default()
        });
        let scheduler = scheduler_with(runner.clone(), true);
        let cancel = CancellationToken::new();

        runner.release.notify_one();
        assert_eq!(
            scheduler.run_job("sync-filings", &cancel).await.unwrap(),
            TriggerOutcome::Started
        );
        runner.release.notify_one();
        assert_eq!(
            scheduler.run_job("sync-filings", &cancel).await.unwrap(),
            TriggerOutcome::Started
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_jobs() {
        let runner = Arc::new(BlockingRunner::default());
        let scheduler = scheduler_with(runner.clone(), false);
        let cancel = CancellationToken::new();

        assert_eq!(
            scheduler.trigger("sync-filings", &cancel).unwrap(),
            TriggerOutcome::Disabled
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            scheduler.trigger("defragment", &cancel),
            Err(Error::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_run_waits_for_triggered_runs() {
        let runner = Arc::new(BlockingRunner::default());
        let scheduler = Arc::new(scheduler_with(runner.clone(), true));
        let cancel = CancellationToken::new();

        assert_eq!(
            scheduler.trigger("sync-filings", &cancel).unwrap(),
            TriggerOutcome::Started
        );
        runner.entered.notified().await;
        cancel.cancel();

        let run = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!run.is_finished());
        assert!(scheduler.status()[0].running);

        runner.release.notify_one();
        run.await.unwrap();
        assert!(!scheduler.status()[0].running);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let runner = Arc::new(BlockingRunner::default());
        let scheduler = scheduler_with(runner.clone(), true);
        let cancel = CancellationToken::new();

        // The first tick fires immediately
        runner.release.notify_one();
        let stopper = {
            let cancel = cancel.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                runner.entered.notified().await;
                cancel.cancel();
            })
        };
        scheduler.run(cancel).await;
        stopper.await.unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
