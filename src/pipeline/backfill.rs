//! Gap detection and backfill

use super::job::JobKind;
use super::orchestrator::{validate_range, Downloader, Tracker};
use crate::archive::today;
use crate::error::{Error, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one backfill run.
///
/// `backfilled_days <= missing_days <= total_days` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillStats {
    pub total_days: u64,
    pub missing_days: u64,
    /// Missing dates whose index was actually requested
    pub backfilled_days: u64,
    /// Filings that reached COMPLETED across the run
    pub total_filings: u64,
}

impl Downloader {
    /// Dates in `[start, end]` with no record of any configured form type.
    /// Reads the record store only.
    pub async fn find_missing_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        if start > end {
            return Err(Error::Validation(format!(
                "Start date {} is after end date {}",
                start, end
            )));
        }

        let covered = self
            .store()
            .dates_with_records(&self.kinds().form_types(), start, end)
            .await?;
        Ok(start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| !covered.contains(d))
            .collect())
    }

    /// Download every missing date in `[start, end]`, oldest first
    pub async fn backfill_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BackfillStats> {
        validate_range(start, end)?;

        let job = self.begin_job(JobKind::Backfill).await?;
        let tracker = self.tracker(&job);
        let result = self.backfill_pass(start, end, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Backfill `[today - days, today]`
    pub async fn backfill_recent_days(
        &self,
        days: u32,
        cancel: &CancellationToken,
    ) -> Result<BackfillStats> {
        let end = today();
        let start = end - Duration::days(i64::from(days));
        self.backfill_date_range(start, end, cancel).await
    }

    /// Scheduled self-healing over the trailing `window_days`
    pub async fn auto_backfill(
        &self,
        window_days: u32,
        cancel: &CancellationToken,
    ) -> Result<BackfillStats> {
        let stats = self.backfill_recent_days(window_days, cancel).await?;
        if stats.missing_days > 0 {
            info!(
                missing = stats.missing_days,
                filings = stats.total_filings,
                "Auto-backfill filled gaps"
            );
        }
        Ok(stats)
    }

    async fn backfill_pass(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<BackfillStats> {
        let missing = self.find_missing_dates(start, end).await?;
        let mut stats = BackfillStats {
            total_days: (end - start).num_days() as u64 + 1,
            missing_days: missing.len() as u64,
            ..BackfillStats::default()
        };
        info!(
            %start,
            %end,
            total = stats.total_days,
            missing = stats.missing_days,
            "Backfill range scanned"
        );

        for date in missing {
            if cancel.is_cancelled() {
                info!(
                    backfilled = stats.backfilled_days,
                    "Backfill cancelled before {}", date
                );
                return Err(Error::Cancelled);
            }
            stats.total_filings += self.date_batch(date, tracker, cancel).await?;
            stats.backfilled_days += 1;
        }

        info!(
            backfilled = stats.backfilled_days,
            filings = stats.total_filings,
            "Backfill finished"
        );
        Ok(stats)
    }
}
