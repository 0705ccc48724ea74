//! Per-filing processing state machine
//!
//! ```text
//! PENDING ─► DOWNLOADING ─► DOWNLOADED ─► PARSING ─► COMPLETED
//!    │            │                          │
//!    ▼            └──────────► FAILED ◄──────┘
//! SKIPPED                        │
//!                                └─► PENDING (retry, while retry_count < max)
//! ```
//!
//! Every status change goes through [`ProcessingStatus::transition`], which
//! rejects anything not drawn above.

use crate::error::{Error, FailureKind, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle status of one filing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Downloading,
    Downloaded,
    Parsing,
    Completed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 7] = [
        ProcessingStatus::Pending,
        ProcessingStatus::Downloading,
        ProcessingStatus::Downloaded,
        ProcessingStatus::Parsing,
        ProcessingStatus::Completed,
        ProcessingStatus::Failed,
        ProcessingStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Downloading => "downloading",
            ProcessingStatus::Downloaded => "downloaded",
            ProcessingStatus::Parsing => "parsing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    /// Whether `self -> to` is a legal move
    pub fn can_transition(self, to: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, to),
            (Pending, Downloading)
                | (Pending, Skipped)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloaded, Parsing)
                | (Parsing, Completed)
                | (Parsing, Failed)
                | (Failed, Pending)
        )
    }

    pub fn transition(self, to: ProcessingStatus) -> Result<ProcessingStatus> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Completed and skipped filings are never fetched again
    pub fn is_done(self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Skipped)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProcessingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| Error::Other(format!("Unknown processing status: {}", s)))
    }
}

/// One filing's processing history, keyed by accession number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub accession_number: String,
    pub form_type: String,
    pub entity_id: String,
    pub filing_date: Option<NaiveDate>,
    pub status: ProcessingStatus,
    pub source_url: String,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub download_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
}

impl ProcessingRecord {
    /// A newly discovered filing
    pub fn new(
        accession_number: impl Into<String>,
        form_type: impl Into<String>,
        entity_id: impl Into<String>,
        filing_date: Option<NaiveDate>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            accession_number: accession_number.into(),
            form_type: form_type.into(),
            entity_id: entity_id.into(),
            filing_date,
            status: ProcessingStatus::Pending,
            source_url: source_url.into(),
            error_message: None,
            failure_kind: None,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            download_started_at: None,
            processed_at: None,
            processing_duration_ms: None,
        }
    }

    fn move_to(&mut self, to: ProcessingStatus) -> Result<()> {
        self.status = self.status.transition(to)?;
        Ok(())
    }

    /// PENDING → SKIPPED, decided before any request
    pub fn mark_skipped(&mut self, reason: impl Into<String>) -> Result<()> {
        self.move_to(ProcessingStatus::Skipped)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// PENDING → DOWNLOADING
    pub fn mark_downloading(&mut self) -> Result<()> {
        self.move_to(ProcessingStatus::Downloading)?;
        let now = Utc::now();
        self.last_attempt_at = Some(now);
        self.download_started_at = Some(now);
        Ok(())
    }

    /// DOWNLOADING → DOWNLOADED
    pub fn mark_downloaded(&mut self) -> Result<()> {
        self.move_to(ProcessingStatus::Downloaded)
    }

    /// DOWNLOADED → PARSING
    pub fn mark_parsing(&mut self) -> Result<()> {
        self.move_to(ProcessingStatus::Parsing)
    }

    /// PARSING → COMPLETED, stamping the elapsed time since DOWNLOADING
    pub fn mark_completed(&mut self) -> Result<()> {
        self.move_to(ProcessingStatus::Completed)?;
        let now = Utc::now();
        self.processed_at = Some(now);
        self.processing_duration_ms = self
            .download_started_at
            .map(|started| (now - started).num_milliseconds().max(0));
        self.error_message = None;
        self.failure_kind = None;
        Ok(())
    }

    /// DOWNLOADING | PARSING → FAILED
    pub fn mark_failed(&mut self, error: &Error) -> Result<()> {
        self.move_to(ProcessingStatus::Failed)?;
        self.retry_count += 1;
        self.error_message = Some(error.to_string());
        self.failure_kind = Some(error.failure_kind());
        self.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    /// FAILED → PENDING, allowed only while retries remain
    pub fn reset_for_retry(&mut self, max_retries: u32) -> Result<()> {
        if self.retry_count >= max_retries {
            return Err(Error::Validation(format!(
                "{} exhausted its {} retries",
                self.accession_number, max_retries
            )));
        }
        self.move_to(ProcessingStatus::Pending)?;
        self.download_started_at = None;
        Ok(())
    }

    /// A failed record that may still be retried
    pub fn is_retry_eligible(&self, max_retries: u32) -> bool {
        self.status == ProcessingStatus::Failed && self.retry_count < max_retries
    }
}
