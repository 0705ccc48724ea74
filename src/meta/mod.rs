//! Metadata storage using SQLite
//!
//! This module handles all local storage including:
//! - Processing records (per-filing lifecycle, the dedup guard)
//! - Download jobs (run history and progress)
//! - Filings (parser output)
//! - Tickers (entity id to symbol mapping)

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, FailureKind, Result};
use crate::filing::{FilingSink, ParsedFiling};
use crate::state::{ProcessingRecord, ProcessingStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Fixed-width UTC timestamp so stored values compare lexically
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Parse(format!("Bad timestamp {:?}: {}", raw, e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn form_type_filter(form_types: &[String]) -> String {
    if form_types.is_empty() {
        String::new()
    } else {
        format!(" AND form_type IN ({})", placeholders(form_types.len()))
    }
}

/// Like `form_type_filter`, but also matching records whose form type is
/// not known yet (single-filing fetches that failed before parsing)
fn form_type_or_unknown_filter(form_types: &[String]) -> String {
    if form_types.is_empty() {
        String::new()
    } else {
        format!(
            " AND (form_type IN ({}) OR form_type = '')",
            placeholders(form_types.len())
        )
    }
}

/// Record counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub downloading: u64,
    pub downloaded: u64,
    pub parsing: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn get(&self, status: ProcessingStatus) -> u64 {
        match status {
            ProcessingStatus::Pending => self.pending,
            ProcessingStatus::Downloading => self.downloading,
            ProcessingStatus::Downloaded => self.downloaded,
            ProcessingStatus::Parsing => self.parsing,
            ProcessingStatus::Completed => self.completed,
            ProcessingStatus::Failed => self.failed,
            ProcessingStatus::Skipped => self.skipped,
        }
    }

    fn add(&mut self, status: ProcessingStatus, n: u64) {
        let slot = match status {
            ProcessingStatus::Pending => &mut self.pending,
            ProcessingStatus::Downloading => &mut self.downloading,
            ProcessingStatus::Downloaded => &mut self.downloaded,
            ProcessingStatus::Parsing => &mut self.parsing,
            ProcessingStatus::Completed => &mut self.completed,
            ProcessingStatus::Failed => &mut self.failed,
            ProcessingStatus::Skipped => &mut self.skipped,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        ProcessingStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Per-filing record storage.
///
/// The accession number is the primary key: creation never overwrites and
/// every update is conditional on the status the caller last saw.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record; `false` when the accession number already exists
    async fn create_if_absent(&self, record: &ProcessingRecord) -> Result<bool>;

    async fn find(&self, accession: &str) -> Result<Option<ProcessingRecord>>;

    /// Write `record` only if the stored status is still `expected`;
    /// `false` means another worker moved it first
    async fn update(&self, record: &ProcessingRecord, expected: ProcessingStatus) -> Result<bool>;

    /// Counts per status, restricted to `form_types` (plus records of not
    /// yet known form type) unless empty
    async fn count_by_status(&self, form_types: &[String]) -> Result<StatusCounts>;

    /// FAILED records with `retry_count < max_retries`, oldest attempt first.
    /// Records of not yet known form type match any `form_types`.
    async fn list_failed(
        &self,
        form_types: &[String],
        max_retries: u32,
    ) -> Result<Vec<ProcessingRecord>>;

    /// Records left in DOWNLOADING, DOWNLOADED or PARSING since before `before`
    async fn list_in_flight(&self, before: DateTime<Utc>) -> Result<Vec<ProcessingRecord>>;

    /// Distinct filing dates in `[start, end]` that have at least one record
    async fn dates_with_records(
        &self,
        form_types: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>>;

    /// Remove settled records created before `cutoff`; in-flight and pending
    /// work is kept
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A persisted download job
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub files_downloaded: i64,
    pub total_files: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Download job history
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or overwrite by id
    async fn save_job(&self, job: &JobRecord) -> Result<()>;

    /// Most recently started first
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>>;

    async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, FromRow)]
struct RecordRow {
    accession_number: String,
    form_type: String,
    entity_id: String,
    filing_date: Option<String>,
    status: String,
    source_url: String,
    error_message: Option<String>,
    failure_kind: Option<String>,
    retry_count: i64,
    created_at: String,
    last_attempt_at: Option<String>,
    download_started_at: Option<String>,
    processed_at: Option<String>,
    processing_duration_ms: Option<i64>,
}

impl TryFrom<RecordRow> for ProcessingRecord {
    type Error = Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        let filing_date = row
            .filing_date
            .as_deref()
            .map(|d| {
                d.parse::<NaiveDate>()
                    .map_err(|e| Error::Parse(format!("Bad filing date {:?}: {}", d, e)))
            })
            .transpose()?;

        Ok(ProcessingRecord {
            accession_number: row.accession_number,
            form_type: row.form_type,
            entity_id: row.entity_id,
            filing_date,
            status: row.status.parse()?,
            source_url: row.source_url,
            error_message: row.error_message,
            failure_kind: row
                .failure_kind
                .as_deref()
                .map(str::parse::<FailureKind>)
                .transpose()?,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            created_at: parse_timestamp(&row.created_at)?,
            last_attempt_at: parse_optional_timestamp(row.last_attempt_at)?,
            download_started_at: parse_optional_timestamp(row.download_started_at)?,
            processed_at: parse_optional_timestamp(row.processed_at)?,
            processing_duration_ms: row.processing_duration_ms,
        })
    }
}

fn into_records(rows: Vec<RecordRow>) -> Result<Vec<ProcessingRecord>> {
    rows.into_iter().map(ProcessingRecord::try_from).collect()
}

/// A stored parsed filing
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FilingRow {
    pub accession_number: String,
    pub kind: String,
    pub form_type: String,
    pub filed_date: Option<String>,
    pub company_name: Option<String>,
    pub filers_json: String,
    pub document_count: Option<i64>,
    pub stored_at: String,
}

/// Exchange ticker for an entity
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Ticker {
    pub ticker: String,
    pub entity_id: String,
    pub title: String,
    pub updated_at: String,
}

/// Metadata database handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the metadata database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::new(&config.paths.db_file).await
    }

    /// Create database with path directly (without full config)
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='processing_records'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(result.is_some())
    }

    // ===== Filing Operations =====

    pub async fn get_filing(&self, accession: &str) -> Result<Option<FilingRow>> {
        let row = sqlx::query_as::<_, FilingRow>("SELECT * FROM filings WHERE accession_number = ?")
            .bind(accession)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn count_filings(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM filings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    // ===== Ticker Operations =====

    /// Insert or refresh tickers in one transaction
    pub async fn upsert_tickers(&self, tickers: &[Ticker]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for ticker in tickers {
            sqlx::query(
                r#"
                INSERT INTO tickers (ticker, entity_id, title, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(ticker) DO UPDATE SET
                    entity_id = excluded.entity_id,
                    title = excluded.title,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&ticker.ticker)
            .bind(&ticker.entity_id)
            .bind(&ticker.title)
            .bind(&ticker.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(tickers.len())
    }

    pub async fn count_tickers(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl RecordStore for MetaDb {
    async fn create_if_absent(&self, record: &ProcessingRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_records (
                accession_number, form_type, entity_id, filing_date, status, source_url,
                error_message, failure_kind, retry_count, created_at, last_attempt_at,
                download_started_at, processed_at, processing_duration_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(accession_number) DO NOTHING
            "#,
        )
        .bind(&record.accession_number)
        .bind(&record.form_type)
        .bind(&record.entity_id)
        .bind(record.filing_date.map(|d| d.to_string()))
        .bind(record.status.as_str())
        .bind(&record.source_url)
        .bind(&record.error_message)
        .bind(record.failure_kind.map(|k| k.to_string()))
        .bind(record.retry_count as i64)
        .bind(format_timestamp(record.created_at))
        .bind(record.last_attempt_at.map(format_timestamp))
        .bind(record.download_started_at.map(format_timestamp))
        .bind(record.processed_at.map(format_timestamp))
        .bind(record.processing_duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, accession: &str) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM processing_records WHERE accession_number = ?",
        )
        .bind(accession)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProcessingRecord::try_from).transpose()
    }

    async fn update(&self, record: &ProcessingRecord, expected: ProcessingStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_records SET
                form_type = ?,
                entity_id = ?,
                filing_date = ?,
                status = ?,
                source_url = ?,
                error_message = ?,
                failure_kind = ?,
                retry_count = ?,
                last_attempt_at = ?,
                download_started_at = ?,
                processed_at = ?,
                processing_duration_ms = ?
            WHERE accession_number = ? AND status = ?
            "#,
        )
        .bind(&record.form_type)
        .bind(&record.entity_id)
        .bind(record.filing_date.map(|d| d.to_string()))
        .bind(record.status.as_str())
        .bind(&record.source_url)
        .bind(&record.error_message)
        .bind(record.failure_kind.map(|k| k.to_string()))
        .bind(record.retry_count as i64)
        .bind(record.last_attempt_at.map(format_timestamp))
        .bind(record.download_started_at.map(format_timestamp))
        .bind(record.processed_at.map(format_timestamp))
        .bind(record.processing_duration_ms)
        .bind(&record.accession_number)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_by_status(&self, form_types: &[String]) -> Result<StatusCounts> {
        let query = format!(
            "SELECT status, COUNT(*) FROM processing_records WHERE 1 = 1{} GROUP BY status",
            form_type_or_unknown_filter(form_types)
        );
        let mut query_builder = sqlx::query_as::<_, (String, i64)>(&query);
        for form_type in form_types {
            query_builder = query_builder.bind(form_type);
        }

        let mut counts = StatusCounts::default();
        for (status, n) in query_builder.fetch_all(&self.pool).await? {
            counts.add(status.parse()?, n as u64);
        }
        Ok(counts)
    }

    async fn list_failed(
        &self,
        form_types: &[String],
        max_retries: u32,
    ) -> Result<Vec<ProcessingRecord>> {
        let query = format!(
            "SELECT * FROM processing_records WHERE status = ? AND retry_count < ?{} \
             ORDER BY last_attempt_at ASC",
            form_type_or_unknown_filter(form_types)
        );
        let mut query_builder = sqlx::query_as::<_, RecordRow>(&query)
            .bind(ProcessingStatus::Failed.as_str())
            .bind(max_retries as i64);
        for form_type in form_types {
            query_builder = query_builder.bind(form_type);
        }
        into_records(query_builder.fetch_all(&self.pool).await?)
    }

    async fn list_in_flight(&self, before: DateTime<Utc>) -> Result<Vec<ProcessingRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM processing_records
            WHERE status IN (?, ?, ?)
              AND COALESCE(download_started_at, last_attempt_at, created_at) < ?
            ORDER BY accession_number
            "#,
        )
        .bind(ProcessingStatus::Downloading.as_str())
        .bind(ProcessingStatus::Downloaded.as_str())
        .bind(ProcessingStatus::Parsing.as_str())
        .bind(format_timestamp(before))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn dates_with_records(
        &self,
        form_types: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>> {
        let query = format!(
            "SELECT DISTINCT filing_date FROM processing_records \
             WHERE filing_date BETWEEN ? AND ?{}",
            form_type_filter(form_types)
        );
        let mut query_builder = sqlx::query_scalar::<_, String>(&query)
            .bind(start.to_string())
            .bind(end.to_string());
        for form_type in form_types {
            query_builder = query_builder.bind(form_type);
        }

        query_builder
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|d| {
                d.parse::<NaiveDate>()
                    .map_err(|e| Error::Parse(format!("Bad filing date {:?}: {}", d, e)))
            })
            .collect()
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM processing_records WHERE created_at < ? AND status IN (?, ?, ?)",
        )
        .bind(format_timestamp(cutoff))
        .bind(ProcessingStatus::Completed.as_str())
        .bind(ProcessingStatus::Skipped.as_str())
        .bind(ProcessingStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for MetaDb {
    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_jobs (id, kind, status, files_downloaded, total_files, started_at, completed_at, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                files_downloaded = excluded.files_downloaded,
                total_files = excluded.total_files,
                completed_at = excluded.completed_at,
                error = excluded.error
            "#,
        )
        .bind(&job.id)
        .bind(&job.kind)
        .bind(&job.status)
        .bind(job.files_downloaded)
        .bind(job.total_files)
        .bind(&job.started_at)
        .bind(&job.completed_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM download_jobs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn delete_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM download_jobs WHERE started_at < ? AND completed_at IS NOT NULL",
        )
        .bind(format_timestamp(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FilingSink for MetaDb {
    async fn persist(&self, kind: &str, filing: &ParsedFiling) -> Result<()> {
        let filers_json = serde_json::to_string(&filing.filers)?;
        sqlx::query(
            r#"
            INSERT INTO filings (accession_number, kind, form_type, filed_date, company_name, filers_json, document_count, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(accession_number) DO UPDATE SET
                kind = excluded.kind,
                form_type = excluded.form_type,
                filed_date = excluded.filed_date,
                company_name = excluded.company_name,
                filers_json = excluded.filers_json,
                document_count = excluded.document_count,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(&filing.accession_number)
        .bind(kind)
        .bind(&filing.form_type)
        .bind(filing.filed_date.map(|d| d.to_string()))
        .bind(filing.company_name())
        .bind(filers_json)
        .bind(filing.document_count.map(i64::from))
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
