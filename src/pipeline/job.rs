//! Download jobs and progress counters

use crate::error::{Error, Result};
use crate::meta::{format_timestamp, JobRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Processed/total pair, readable while a run updates it
#[derive(Debug, Default)]
pub struct JobProgress {
    processed: AtomicU64,
    total: AtomicU64,
}

/// Point-in-time copy of a [`JobProgress`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
}

impl JobProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }

    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }
}

/// What started a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Date,
    DateRange,
    Latest,
    Accession,
    Quarter,
    History,
    Retry,
    Backfill,
    Recover,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Date => write!(f, "date"),
            JobKind::DateRange => write!(f, "date_range"),
            JobKind::Latest => write!(f, "latest"),
            JobKind::Accession => write!(f, "accession"),
            JobKind::Quarter => write!(f, "quarter"),
            JobKind::History => write!(f, "history"),
            JobKind::Retry => write!(f, "retry"),
            JobKind::Backfill => write!(f, "backfill"),
            JobKind::Recover => write!(f, "recover"),
        }
    }
}

/// Download job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One orchestrator run. Owned by the run; callers observe it through the
/// shared progress counters or the persisted [`JobRecord`].
#[derive(Debug)]
pub struct DownloadJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: Arc<JobProgress>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            progress: JobProgress::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::InProgress;
        self.started_at = Utc::now();
    }

    /// Settle the job from the run's result
    pub fn finish<T>(&mut self, result: &Result<T>) {
        self.status = match result {
            Ok(_) => JobStatus::Completed,
            Err(Error::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        self.error = result.as_ref().err().map(|e| e.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn to_record(&self) -> JobRecord {
        let progress = self.progress.snapshot();
        JobRecord {
            id: self.id.to_string(),
            kind: self.kind.to_string(),
            status: self.status.to_string(),
            files_downloaded: progress.processed as i64,
            total_files: progress.total as i64,
            started_at: format_timestamp(self.started_at),
            completed_at: self.completed_at.map(format_timestamp),
            error: self.error.clone(),
        }
    }
}
