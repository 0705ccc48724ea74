//! Retry policy and the failed-download retry pass

use super::job::JobKind;
use super::orchestrator::{BatchStats, Downloader, Tracker};
use crate::config::DownloadConfig;
use crate::error::{FailureKind, Result};
use crate::state::ProcessingRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bounded exponential backoff between attempts of one filing.
///
/// After the n-th failure the record waits `min(base * 2^(n-1), max)`,
/// multiplied by `blocked_multiplier` when the archive refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub blocked_multiplier: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_secs(config.retry_base_backoff_secs),
            max_backoff: Duration::from_secs(config.retry_max_backoff_secs),
            blocked_multiplier: config.blocked_backoff_multiplier.max(1),
        }
    }

    pub fn backoff(&self, record: &ProcessingRecord) -> Duration {
        if record.retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (record.retry_count - 1).min(30);
        let wait = self
            .base_backoff
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_backoff);
        if record.failure_kind == Some(FailureKind::Blocked) {
            wait.saturating_mul(self.blocked_multiplier)
        } else {
            wait
        }
    }

    /// Whether enough time has passed since the last attempt
    pub fn is_due(&self, record: &ProcessingRecord, now: DateTime<Utc>) -> bool {
        let Some(last_attempt) = record.last_attempt_at else {
            return true;
        };
        match chrono::Duration::from_std(self.backoff(record)) {
            Ok(wait) => last_attempt + wait <= now,
            Err(_) => false,
        }
    }
}

/// Outcome of one retry pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    /// FAILED records below the retry bound
    pub eligible: u64,
    /// Eligible records still inside their backoff window
    pub deferred: u64,
    pub batch: BatchStats,
}

impl Downloader {
    /// Re-submit FAILED records with `retry_count < max_retries` through the
    /// single-filing path. Returns how many reached COMPLETED.
    pub async fn retry_failed_downloads(
        &self,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        Ok(self
            .retry_failed_with_stats(max_retries, cancel)
            .await?
            .batch
            .completed)
    }

    pub async fn retry_failed_with_stats(
        &self,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<RetryStats> {
        let job = self.begin_job(JobKind::Retry).await?;
        let tracker = self.tracker(&job);

        let result = self.retry_pass(max_retries, &tracker, cancel).await;

        if let Ok(stats) = &result {
            info!(
                eligible = stats.eligible,
                deferred = stats.deferred,
                completed = stats.batch.completed,
                failed = stats.batch.failed,
                "Retry pass finished"
            );
        }
        self.finish_job(job, &result).await;
        result
    }

    async fn retry_pass(
        &self,
        max_retries: u32,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<RetryStats> {
        let policy = RetryPolicy {
            max_retries,
            ..self.policy()
        };
        let now = Utc::now();
        let failed = self
            .store()
            .list_failed(&self.kinds().form_types(), max_retries)
            .await?;

        let mut stats = RetryStats {
            eligible: failed.len() as u64,
            ..RetryStats::default()
        };
        let (due, deferred): (Vec<_>, Vec<_>) = failed
            .into_iter()
            .partition(|record| policy.is_due(record, now));
        stats.deferred = deferred.len() as u64;
        debug!(
            eligible = stats.eligible,
            deferred = stats.deferred,
            "Selected failed records for retry"
        );

        stats.batch = self
            .process_records(due, max_retries, tracker, cancel)
            .await?;
        Ok(stats)
    }
}
