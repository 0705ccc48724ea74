//! Download orchestrator
//!
//! Every discovery path (daily index, quarterly index, latest feed, bare
//! accession number, retry) funnels into the same per-filing sequence:
//!
//! 1. create the record, or find the existing one (dedup)
//! 2. take a rate permit, then claim the record (PENDING → DOWNLOADING)
//! 3. fetch, parse, persist, persisting each transition as it happens
//!
//! A failure on one filing is recorded on its record and the batch moves on.

use super::job::{DownloadJob, JobKind, JobProgress};
use super::retry::RetryPolicy;
use crate::archive::{
    filer_id_from_accession, is_valid_accession, quarters_since, today, ArchiveClient,
    IndexListing, MasterIndexCrawler, MasterIndexEntry, Quarter,
};
use crate::config::{Config, DownloadConfig};
use crate::error::{Error, Result};
use crate::filing::{
    route_builtin, FilingKind, FilingParser, FilingSink, KindSet, ParsedFiling,
    SubmissionHeaderParser,
};
use crate::meta::{JobStore, MetaDb, RecordStore, StatusCounts};
use crate::state::{ProcessingRecord, ProcessingStatus};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one filing in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed,
    /// Already COMPLETED or SKIPPED; no request was made
    Duplicate,
    /// Rejected before any request
    Skipped,
    /// FAILED with no retries left
    Exhausted,
    /// FAILED and still inside its backoff window
    Deferred,
    /// Another worker holds the record
    Busy,
}

/// Per-batch tallies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub completed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub busy: u64,
}

impl BatchStats {
    fn tally(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Duplicate => self.duplicates += 1,
            ItemOutcome::Skipped | ItemOutcome::Exhausted => self.skipped += 1,
            ItemOutcome::Deferred => self.deferred += 1,
            ItemOutcome::Busy => self.busy += 1,
        }
    }
}

/// Record counts for the configured kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatistics {
    pub kinds: Vec<String>,
    pub counts: StatusCounts,
    pub total: u64,
}

/// Outcome of a retention cleanup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    pub records_deleted: u64,
    pub jobs_deleted: u64,
}

/// Updates a job's own counters and, when set, an outside observer's
pub(crate) struct Tracker {
    job: Arc<JobProgress>,
    observer: Option<Arc<JobProgress>>,
}

impl Tracker {
    fn add_total(&self, n: u64) {
        self.job.add_total(n);
        if let Some(observer) = &self.observer {
            observer.add_total(n);
        }
    }

    fn record_processed(&self) {
        self.job.record_processed();
        if let Some(observer) = &self.observer {
            observer.record_processed();
        }
    }
}

/// An index entry routed to the kind that handles it
struct Candidate {
    accession: String,
    entry: MasterIndexEntry,
    kind: Arc<dyn FilingKind>,
}

enum WorkItem {
    Entry(Candidate),
    Retry(ProcessingRecord, u32),
}

enum Admission {
    Ready(ProcessingRecord),
    Skip(ItemOutcome),
}

/// Whether a re-discovered FAILED record must wait out its retry backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Honor,
    Ignore,
}

/// Tunables taken from `[download]`
#[derive(Debug, Clone, Copy)]
struct Settings {
    workers: usize,
    item_delay: Duration,
    latest_count: usize,
}

/// Generic downloader for a set of filing kinds
#[derive(Clone)]
pub struct Downloader {
    kinds: KindSet,
    crawler: MasterIndexCrawler,
    client: Arc<ArchiveClient>,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn FilingSink>,
    jobs: Arc<dyn JobStore>,
    policy: RetryPolicy,
    settings: Settings,
    observer: Option<Arc<JobProgress>>,
}

impl Downloader {
    pub fn new(
        client: Arc<ArchiveClient>,
        kinds: KindSet,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn FilingSink>,
        jobs: Arc<dyn JobStore>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            kinds,
            crawler: MasterIndexCrawler::new(client.clone()),
            client,
            store,
            sink,
            jobs,
            policy: RetryPolicy::from_config(config),
            settings: Settings {
                workers: config.workers.max(1),
                item_delay: Duration::from_millis(config.item_delay_ms),
                latest_count: config.latest_count,
            },
            observer: None,
        }
    }

    /// Downloader backed by the metadata database for records, filings and
    /// jobs, sharing `client`'s rate limiter
    pub fn with_db(config: &Config, client: Arc<ArchiveClient>, db: MetaDb) -> Result<Self> {
        let kinds = KindSet::from_tags(&config.download.kinds)?;
        let db = Arc::new(db);
        Ok(Self::new(
            client,
            kinds,
            db.clone(),
            db.clone(),
            db,
            &config.download,
        ))
    }

    /// Same downloader, additionally reporting into `progress`
    pub fn with_progress(&self, progress: Arc<JobProgress>) -> Self {
        Self {
            observer: Some(progress),
            ..self.clone()
        }
    }

    pub fn kinds(&self) -> &KindSet {
        &self.kinds
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn latest_count(&self) -> usize {
        self.settings.latest_count
    }

    pub(crate) fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ===== Job bookkeeping =====

    pub(crate) async fn begin_job(&self, kind: JobKind) -> Result<DownloadJob> {
        let mut job = DownloadJob::new(kind);
        job.start();
        self.jobs.save_job(&job.to_record()).await?;
        info!(job_id = %job.id, kind = %kind, "Download job started");
        Ok(job)
    }

    pub(crate) async fn finish_job<T>(&self, mut job: DownloadJob, result: &Result<T>) {
        job.finish(result);
        let progress = job.progress.snapshot();
        info!(
            job_id = %job.id,
            kind = %job.kind,
            status = %job.status,
            processed = progress.processed,
            total = progress.total,
            "Download job finished"
        );
        if let Err(e) = self.jobs.save_job(&job.to_record()).await {
            warn!(job_id = %job.id, "Failed to persist job status: {}", e);
        }
    }

    pub(crate) fn tracker(&self, job: &DownloadJob) -> Tracker {
        Tracker {
            job: job.progress.clone(),
            observer: self.observer.clone(),
        }
    }

    // ===== Public operations =====

    /// Ingest every relevant filing in the daily index for `date`.
    /// Returns how many reached COMPLETED.
    pub async fn download_for_date(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<u64> {
        let job = self.begin_job(JobKind::Date).await?;
        let tracker = self.tracker(&job);
        let result = self.date_batch(date, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Dates from `start` to `end` inclusive, oldest first
    pub async fn download_for_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        validate_range(start, end)?;

        let job = self.begin_job(JobKind::DateRange).await?;
        let tracker = self.tracker(&job);
        let result = self.range_batches(start, end, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Ingest up to `max_count` of the newest filings from the live feed
    pub async fn download_latest_filings(
        &self,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let job = self.begin_job(JobKind::Latest).await?;
        let tracker = self.tracker(&job);
        let result = self.latest_batch(max_count, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Fetch one filing directly. Returns whether it is COMPLETED afterwards;
    /// an already completed filing is not requested again.
    pub async fn download_by_accession(
        &self,
        accession: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let accession = accession.trim();
        if !is_valid_accession(accession) {
            return Err(Error::Validation(format!(
                "Invalid accession number: {}",
                accession
            )));
        }

        let job = self.begin_job(JobKind::Accession).await?;
        let tracker = self.tracker(&job);
        let result = self.accession_item(accession, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Ingest one quarter's full index
    pub async fn download_for_quarter(
        &self,
        quarter: Quarter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let job = self.begin_job(JobKind::Quarter).await?;
        let tracker = self.tracker(&job);
        let result = self.quarter_batch(quarter, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Every quarter from `start_year` through the current one, oldest first
    pub async fn download_history(
        &self,
        start_year: i32,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let current_year = today().year();
        if start_year > current_year {
            return Err(Error::Validation(format!(
                "History start year {} is in the future",
                start_year
            )));
        }

        let job = self.begin_job(JobKind::History).await?;
        let tracker = self.tracker(&job);
        let result = self.history_batches(start_year, &tracker, cancel).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Record counts per status for the configured kinds
    pub async fn get_statistics(&self) -> Result<DownloadStatistics> {
        let counts = self.store.count_by_status(&self.kinds.form_types()).await?;
        Ok(DownloadStatistics {
            kinds: self.kinds.tags(),
            total: counts.total(),
            counts,
        })
    }

    /// Move records abandoned mid-flight (for example by a crash) to FAILED
    /// so the retry pass picks them up. Only records untouched for at least
    /// `older_than` are considered.
    pub async fn recover_interrupted(&self, older_than: Duration) -> Result<u64> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Validation(format!("Recovery age out of range: {}", e)))?;

        let job = self.begin_job(JobKind::Recover).await?;
        let tracker = self.tracker(&job);
        let result = self.recover_pass(Utc::now() - older_than, &tracker).await;
        self.finish_job(job, &result).await;
        result
    }

    /// Delete settled records and finished jobs older than `max_age_days`
    pub async fn cleanup_older_than(&self, max_age_days: u32) -> Result<CleanupStats> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let stats = CleanupStats {
            records_deleted: self.store.delete_before(cutoff).await?,
            jobs_deleted: self.jobs.delete_jobs_before(cutoff).await?,
        };
        info!(
            records = stats.records_deleted,
            jobs = stats.jobs_deleted,
            "Removed records older than {} days",
            max_age_days
        );
        Ok(stats)
    }

    // ===== Batches =====

    /// One day's index; a missing index is zero filings, not an error
    pub(crate) async fn date_batch(
        &self,
        date: NaiveDate,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let listing = match self.crawler.fetch_daily_index(date, cancel).await {
            Ok(listing) => listing,
            Err(Error::NotAvailable(reason)) => {
                info!(%date, "No daily index: {}", reason);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let candidates = self.select_entries(listing.entries());
        debug!(%date, candidates = candidates.len(), "Daily index selected");
        let stats = self.process_candidates(candidates, tracker, cancel).await?;
        info!(
            %date,
            completed = stats.completed,
            failed = stats.failed,
            duplicates = stats.duplicates,
            "Daily batch finished"
        );
        Ok(stats.completed)
    }

    async fn range_batches(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut completed = 0;
        for date in start.iter_days().take_while(|d| *d <= end) {
            if cancel.is_cancelled() {
                info!(%date, "Range cancelled before this date");
                return Err(Error::Cancelled);
            }
            completed += self.date_batch(date, tracker, cancel).await?;
        }
        Ok(completed)
    }

    async fn latest_batch(
        &self,
        max_count: usize,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut entries = Vec::new();
        for form_type in self.kinds.base_form_types() {
            match self.crawler.fetch_latest(&form_type, max_count, cancel).await {
                Ok(found) => entries.extend(found),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(form_type = %form_type, "Latest feed unavailable: {}", e),
            }
        }

        let mut candidates = self.select_entries(entries.into_iter().map(Ok));
        candidates.sort_by(|a, b| b.entry.date_filed.cmp(&a.entry.date_filed));
        candidates.truncate(max_count);

        let stats = self.process_candidates(candidates, tracker, cancel).await?;
        info!(
            completed = stats.completed,
            duplicates = stats.duplicates,
            "Latest filings batch finished"
        );
        Ok(stats.completed)
    }

    async fn quarter_batch(
        &self,
        quarter: Quarter,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let listing: IndexListing = match self.crawler.fetch_quarterly_index(quarter, cancel).await
        {
            Ok(listing) => listing,
            Err(Error::NotAvailable(reason)) => {
                info!(%quarter, "No quarterly index: {}", reason);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let candidates = self.select_entries(listing.entries());
        info!(%quarter, candidates = candidates.len(), "Quarterly index selected");
        let stats = self.process_candidates(candidates, tracker, cancel).await?;
        Ok(stats.completed)
    }

    async fn history_batches(
        &self,
        start_year: i32,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut completed = 0;
        for quarter in quarters_since(start_year, today()) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.quarter_batch(quarter, tracker, cancel).await {
                Ok(n) => completed += n,
                Err(e) if matches!(e, Error::Cancelled) || e.is_validation() => return Err(e),
                Err(e) => warn!(%quarter, "Skipping quarter: {}", e),
            }
        }
        Ok(completed)
    }

    async fn recover_pass(&self, before: DateTime<Utc>, tracker: &Tracker) -> Result<u64> {
        let stuck = self.store.list_in_flight(before).await?;
        tracker.add_total(stuck.len() as u64);

        let mut recovered = 0;
        for mut record in stuck {
            let expected = record.status;
            if expected == ProcessingStatus::Downloaded {
                record.mark_parsing()?;
            }
            record.mark_failed(&Error::Cancelled)?;
            if self.store.update(&record, expected).await? {
                info!(
                    accession = %record.accession_number,
                    from = %expected,
                    "Recovered interrupted record"
                );
                recovered += 1;
            }
            tracker.record_processed();
        }
        Ok(recovered)
    }

    async fn accession_item(
        &self,
        accession: &str,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        tracker.add_total(1);

        let url = self.client.accession_url(accession)?;
        let filer = filer_id_from_accession(accession).unwrap_or_default();
        let record = ProcessingRecord::new(accession, "", filer, None, url);

        // A targeted fetch retries a FAILED filing without waiting out its backoff
        let outcome = match self.admit(record, Backoff::Ignore).await? {
            Admission::Ready(record) => {
                let kind = self.kinds.route(&record.form_type).cloned();
                self.fetch_record(record, kind, cancel).await?
            }
            Admission::Skip(outcome) => outcome,
        };
        tracker.record_processed();
        debug!(accession, ?outcome, "Accession fetch finished");

        Ok(self
            .store
            .find(accession)
            .await?
            .is_some_and(|r| r.status == ProcessingStatus::Completed))
    }

    // ===== Per-filing work =====

    /// Keep entries of configured kinds, first occurrence per accession.
    /// Quarterly and daily indexes list a filing once per filer.
    fn select_entries(
        &self,
        entries: impl IntoIterator<Item = Result<MasterIndexEntry>>,
    ) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping malformed index line: {}", e);
                    continue;
                }
            };
            let Some(kind) = self.kinds.route(&entry.form_type) else {
                continue;
            };
            let Some(accession) = entry.accession_number() else {
                debug!(link = %entry.document_link, "Index entry without accession number");
                continue;
            };
            if seen.insert(accession.clone()) {
                candidates.push(Candidate {
                    accession,
                    kind: kind.clone(),
                    entry,
                });
            }
        }
        candidates
    }

    async fn process_candidates(
        &self,
        candidates: Vec<Candidate>,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<BatchStats> {
        let items = candidates.into_iter().map(WorkItem::Entry).collect();
        self.run_items(items, tracker, cancel).await
    }

    /// Retry FAILED records; each is reset to PENDING under `max_retries`
    pub(crate) async fn process_records(
        &self,
        records: Vec<ProcessingRecord>,
        max_retries: u32,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<BatchStats> {
        let items = records
            .into_iter()
            .map(|record| WorkItem::Retry(record, max_retries))
            .collect();
        self.run_items(items, tracker, cancel).await
    }

    /// Run items through at most `workers` concurrent slots. After
    /// cancellation no new item starts; started items finish.
    async fn run_items(
        &self,
        items: Vec<WorkItem>,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> Result<BatchStats> {
        tracker.add_total(items.len() as u64);
        let delay = self.settings.item_delay;

        let mut results = stream::iter(items.into_iter().enumerate())
            .map(move |(i, item)| async move {
                if i > 0 && !delay.is_zero() {
                    pace(delay, cancel).await?;
                }
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let outcome = match item {
                    WorkItem::Entry(candidate) => self.process_entry(candidate, cancel).await,
                    WorkItem::Retry(record, max_retries) => {
                        self.retry_record(record, max_retries, cancel).await
                    }
                };
                if !matches!(outcome, Err(Error::Cancelled)) {
                    tracker.record_processed();
                }
                outcome
            })
            .buffer_unordered(self.settings.workers);

        let mut stats = BatchStats::default();
        let mut cancelled = false;
        while let Some(result) = results.next().await {
            match result {
                Ok(outcome) => stats.tally(outcome),
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!("Filing could not be processed: {}", e);
                    stats.failed += 1;
                }
            }
        }

        if cancelled {
            info!(
                completed = stats.completed,
                "Batch cancelled; finished work is kept"
            );
            return Err(Error::Cancelled);
        }
        Ok(stats)
    }

    async fn process_entry(
        &self,
        candidate: Candidate,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        let Candidate {
            accession,
            entry,
            kind,
        } = candidate;

        let url = kind.document_url(&self.client, &entry);
        let mut record = ProcessingRecord::new(
            accession,
            entry.form_type.trim(),
            entry.entity_id.trim(),
            Some(entry.date_filed),
            url,
        );

        if let Err(reason) = entry.validate() {
            if !self.store.create_if_absent(&record).await? {
                return Ok(ItemOutcome::Duplicate);
            }
            record.mark_skipped(reason.as_str())?;
            self.store.update(&record, ProcessingStatus::Pending).await?;
            debug!(accession = %record.accession_number, "Skipped invalid entry: {}", reason);
            return Ok(ItemOutcome::Skipped);
        }

        match self.admit(record, Backoff::Honor).await? {
            Admission::Ready(record) => self.fetch_record(record, Some(kind), cancel).await,
            Admission::Skip(outcome) => Ok(outcome),
        }
    }

    async fn retry_record(
        &self,
        mut record: ProcessingRecord,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !record.is_retry_eligible(max_retries) {
            return Ok(ItemOutcome::Exhausted);
        }
        record.reset_for_retry(max_retries)?;
        if !self.store.update(&record, ProcessingStatus::Failed).await? {
            return Ok(ItemOutcome::Busy);
        }
        debug!(
            accession = %record.accession_number,
            retry_count = record.retry_count,
            "Retrying filing"
        );

        let kind = self
            .kinds
            .route(&record.form_type)
            .cloned()
            .or_else(|| route_builtin(&record.form_type));
        self.fetch_record(record, kind, cancel).await
    }

    /// Create the record or decide what to do with the one already stored
    async fn admit(&self, record: ProcessingRecord, backoff: Backoff) -> Result<Admission> {
        if self.store.create_if_absent(&record).await? {
            return Ok(Admission::Ready(record));
        }

        let Some(mut existing) = self.store.find(&record.accession_number).await? else {
            return Ok(Admission::Skip(ItemOutcome::Busy));
        };

        match existing.status {
            status if status.is_done() => {
                debug!(accession = %existing.accession_number, %status, "Already processed");
                Ok(Admission::Skip(ItemOutcome::Duplicate))
            }
            ProcessingStatus::Pending => Ok(Admission::Ready(existing)),
            ProcessingStatus::Failed => {
                if !existing.is_retry_eligible(self.policy.max_retries) {
                    return Ok(Admission::Skip(ItemOutcome::Exhausted));
                }
                if backoff == Backoff::Honor && !self.policy.is_due(&existing, Utc::now()) {
                    return Ok(Admission::Skip(ItemOutcome::Deferred));
                }
                existing.reset_for_retry(self.policy.max_retries)?;
                if self.store.update(&existing, ProcessingStatus::Failed).await? {
                    Ok(Admission::Ready(existing))
                } else {
                    Ok(Admission::Skip(ItemOutcome::Busy))
                }
            }
            _ => Ok(Admission::Skip(ItemOutcome::Busy)),
        }
    }

    /// Fetch, parse and persist a PENDING record. With no `kind`, the kind
    /// is chosen from the form type the document declares.
    async fn fetch_record(
        &self,
        mut record: ProcessingRecord,
        kind: Option<Arc<dyn FilingKind>>,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome> {
        // A cancelled wait leaves the record PENDING
        let permit = self.client.permit(cancel).await?;

        record.mark_downloading()?;
        if !self.store.update(&record, ProcessingStatus::Pending).await? {
            debug!(accession = %record.accession_number, "Record claimed by another worker");
            return Ok(ItemOutcome::Busy);
        }

        let body = match self.client.get_bytes(permit, &record.source_url).await {
            Ok(body) => body,
            Err(e) => return self.fail(record, e).await,
        };

        record.mark_downloaded()?;
        if !self.store.update(&record, ProcessingStatus::Downloading).await? {
            return Ok(ItemOutcome::Busy);
        }
        record.mark_parsing()?;
        if !self.store.update(&record, ProcessingStatus::Downloaded).await? {
            return Ok(ItemOutcome::Busy);
        }

        let (kind, parsed) = match self.parse(&record.accession_number, kind, &body) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(record, e).await,
        };

        if record.form_type.is_empty() {
            record.form_type = parsed.form_type.clone();
        }
        if record.filing_date.is_none() {
            record.filing_date = parsed.filed_date;
        }

        if let Err(e) = self.sink.persist(kind.tag(), &parsed).await {
            return self.fail(record, e).await;
        }

        record.mark_completed()?;
        if !self.store.update(&record, ProcessingStatus::Parsing).await? {
            return Ok(ItemOutcome::Busy);
        }

        debug!(
            accession = %record.accession_number,
            kind = kind.tag(),
            duration_ms = record.processing_duration_ms,
            "Filing completed"
        );
        Ok(ItemOutcome::Completed)
    }

    fn parse(
        &self,
        accession: &str,
        kind: Option<Arc<dyn FilingKind>>,
        body: &[u8],
    ) -> Result<(Arc<dyn FilingKind>, ParsedFiling)> {
        let kind = match kind {
            Some(kind) => kind,
            None => {
                let header = SubmissionHeaderParser.parse(accession, body)?;
                self.kinds
                    .route(&header.form_type)
                    .cloned()
                    .or_else(|| route_builtin(&header.form_type))
                    .ok_or_else(|| {
                        Error::Parse(format!(
                            "{}: form type {} is not handled",
                            accession, header.form_type
                        ))
                    })?
            }
        };
        let parsed = kind.parser().parse(accession, body)?;
        Ok((kind, parsed))
    }

    async fn fail(&self, mut record: ProcessingRecord, error: Error) -> Result<ItemOutcome> {
        let expected = record.status;
        record.mark_failed(&error)?;
        warn!(
            accession = %record.accession_number,
            failure = %error.failure_kind(),
            retry_count = record.retry_count,
            "Filing failed: {}",
            error
        );
        if !self.store.update(&record, expected).await? {
            debug!(accession = %record.accession_number, "Record moved by another worker");
            return Ok(ItemOutcome::Busy);
        }
        Ok(ItemOutcome::Failed)
    }
}

/// Reject reversed ranges and ranges reaching into the future
pub fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(Error::Validation(format!(
            "Start date {} is after end date {}",
            start, end
        )));
    }
    if end > today() {
        return Err(Error::Validation(format!(
            "End date {} is in the future",
            end
        )));
    }
    Ok(())
}

async fn pace(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::RateLimiter;
    use crate::filing::sample_submission;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) struct Harness {
        pub server: MockServer,
        pub db: MetaDb,
        pub downloader: Downloader,
        _tmp: TempDir,
    }

    pub(crate) async fn harness(kinds: &[&str], mutate: impl FnOnce(&mut Config)) -> Harness {
        let server = MockServer::start().await;
        let tmp = TempDir::new().unwrap();

        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");
        config.archive.base_url = server.uri();
        config.download.kinds = kinds.iter().map(|k| k.to_string()).collect();
        config.download.retry_base_backoff_secs = 0;
        config.download.retry_max_backoff_secs = 0;
        mutate(&mut config);

        let db = MetaDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();

        let client = Arc::new(
            ArchiveClient::new(
                &config.archive,
                RateLimiter::new(1000, Duration::from_secs(1)),
            )
            .unwrap(),
        );
        let downloader = Downloader::with_db(&config, client, db.clone()).unwrap();

        Harness {
            server,
            db,
            downloader,
            _tmp: tmp,
        }
    }

    pub(crate) fn index_for(date: NaiveDate, lines: &[(&str, &str, &str)]) -> String {
        let mut index = String::from(
            "Description: Daily Index\nCIK|Company Name|Form Type|Date Filed|File Name\n\
             --------------------------------------------------------------------------------\n",
        );
        for (entity, form, accession) in lines {
            index.push_str(&format!(
                "{}|ENTITY {}|{}|{}|edgar/data/{}/{}.txt\n",
                entity,
                entity,
                form,
                date.format("%Y%m%d"),
                entity,
                accession
            ));
        }
        index
    }

    pub(crate) async fn mount_daily_index(server: &MockServer, date: NaiveDate, body: String) {
        Mock::given(method("GET"))
            .and(path(format!(
                "/Archives/edgar/daily-index/master.{}.idx",
                date.format("%Y%m%d")
            )))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    pub(crate) async fn mount_document(
        server: &MockServer,
        entity: &str,
        accession: &str,
        form: &str,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/Archives/edgar/data/{}/{}.txt", entity, accession)))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(sample_submission(accession, form)),
            )
            .mount(server)
            .await;
    }

    async fn mount_accession(server: &MockServer, accession: &str, form: &str) {
        let filer = filer_id_from_accession(accession).unwrap();
        Mock::given(method("GET"))
            .and(path(format!(
                "/Archives/edgar/data/{}/{}/{}.txt",
                filer,
                accession.replace('-', ""),
                accession
            )))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(sample_submission(accession, form)),
            )
            .mount(server)
            .await;
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    async fn document_requests(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path().starts_with("/Archives/edgar/data/"))
            .count()
    }

    async fn wait_for_document_requests(server: &MockServer, n: usize) {
        for _ in 0..500 {
            if document_requests(server).await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} document requests", n);
    }

    #[tokio::test]
    async fn test_download_for_date_is_idempotent() {
        let h = harness(&["ownership"], |_| {}).await;
        let index = index_for(
            day(),
            &[
                ("1000045", "4", "0000950170-24-000001"),
                // Same filing listed under a second filer
                ("1000046", "4", "0000950170-24-000001"),
                ("1000180", "8-K", "0001000180-24-000003"),
                ("1000200", "4/A", "0001000200-24-000009"),
            ],
        );
        mount_daily_index(&h.server, day(), index).await;
        mount_document(&h.server, "1000045", "0000950170-24-000001", "4").await;
        mount_document(&h.server, "1000200", "0001000200-24-000009", "4/A").await;

        let cancel = CancellationToken::new();
        let first = h.downloader.download_for_date(day(), &cancel).await.unwrap();
        assert_eq!(first, 2);
        assert_eq!(document_requests(&h.server).await, 2);

        let second = h.downloader.download_for_date(day(), &cancel).await.unwrap();
        assert_eq!(second, 0);
        // No document was requested again
        assert_eq!(document_requests(&h.server).await, 2);

        let stats = h.downloader.get_statistics().await.unwrap();
        assert_eq!(stats.counts.completed, 2);
        assert_eq!(stats.total, 2);
        assert!(h.db.find("0001000180-24-000003").await.unwrap().is_none());

        let record = h.db.find("0000950170-24-000001").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert!(record.processed_at.is_some());
        assert!(record.processing_duration_ms.is_some());
        assert!(h.db.get_filing("0000950170-24-000001").await.unwrap().is_some());

        let jobs = h.db.recent_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == "completed"));
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let h = harness(&["ownership"], |_| {}).await;
        let index = index_for(
            day(),
            &[
                ("1", "4", "0000000001-24-000001"),
                ("2", "4", "0000000002-24-000002"),
                ("3", "4", "0000000003-24-000003"),
            ],
        );
        mount_daily_index(&h.server, day(), index).await;
        mount_document(&h.server, "1", "0000000001-24-000001", "4").await;
        Mock::given(method("GET"))
            .and(path("/Archives/edgar/data/2/0000000002-24-000002.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("Request Rate Threshold Exceeded"),
            )
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Archives/edgar/data/3/0000000003-24-000003.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>truncated"))
            .mount(&h.server)
            .await;

        let completed = h
            .downloader
            .download_for_date(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completed, 1);

        let blocked = h.db.find("0000000002-24-000002").await.unwrap().unwrap();
        assert_eq!(blocked.status, ProcessingStatus::Failed);
        assert_eq!(blocked.failure_kind, Some(crate::error::FailureKind::Blocked));
        assert_eq!(blocked.retry_count, 1);

        let unparsable = h.db.find("0000000003-24-000003").await.unwrap().unwrap();
        assert_eq!(unparsable.status, ProcessingStatus::Failed);
        assert_eq!(unparsable.failure_kind, Some(crate::error::FailureKind::Parse));
    }

    #[tokio::test]
    async fn test_missing_index_yields_zero() {
        let h = harness(&["ownership"], |_| {}).await;
        let completed = h
            .downloader
            .download_for_date(day(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completed, 0);
    }

    #[tokio::test]
    async fn test_range_validation() {
        let h = harness(&["ownership"], |_| {}).await;
        let cancel = CancellationToken::new();

        let reversed = h
            .downloader
            .download_for_date_range(day(), day().pred_opt().unwrap(), &cancel)
            .await;
        assert!(matches!(reversed, Err(Error::Validation(_))));

        let future = h
            .downloader
            .download_for_date_range(day(), today().succ_opt().unwrap(), &cancel)
            .await;
        assert!(matches!(future, Err(Error::Validation(_))));
        assert!(h.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_range_starts_nothing() {
        let h = harness(&["ownership"], |_| {}).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .downloader
            .download_for_date_range(day(), day().succ_opt().unwrap(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(h.server.received_requests().await.unwrap().is_empty());

        let jobs = h.db.recent_jobs(1).await.unwrap();
        assert_eq!(jobs[0].status, "cancelled");
    }

    #[tokio::test]
    async fn test_download_by_accession() {
        let h = harness(&["ownership"], |_| {}).await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/Archives/edgar/data/950170/000095017024000001/.*\.txt$"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sample_submission(
                "0000950170-24-000001",
                "SC 13G",
            )))
            .expect(1)
            .mount(&h.server)
            .await;

        let cancel = CancellationToken::new();
        assert!(h
            .downloader
            .download_by_accession("0000950170-24-000001", &cancel)
            .await
            .unwrap());
        // Already completed, so no second request
        assert!(h
            .downloader
            .download_by_accession("0000950170-24-000001", &cancel)
            .await
            .unwrap());

        let record = h.db.find("0000950170-24-000001").await.unwrap().unwrap();
        assert_eq!(record.form_type, "SC 13G");
        assert_eq!(record.filing_date, Some(day()));
        let filing = h.db.get_filing("0000950170-24-000001").await.unwrap().unwrap();
        assert_eq!(filing.kind, "beneficial-ownership");

        let invalid = h.downloader.download_by_accession("12345", &cancel).await;
        assert!(matches!(invalid, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_latest_filings_bounded() {
        let h = harness(&["current-report"], |_| {}).await;
        let feed = r#"<feed>
<entry><title>8-K - ACME CORP (0000000042) (Filer)</title>
<updated>2024-01-03T10:00:00-05:00</updated>
<category term="8-K"/>
<id>urn:tag:sec.gov,2008:accession-number=0000000042-24-000002</id></entry>
<entry><title>8-K - ACME CORP (0000000042) (Filer)</title>
<updated>2024-01-02T10:00:00-05:00</updated>
<category term="8-K"/>
<id>urn:tag:sec.gov,2008:accession-number=0000000042-24-000001</id></entry>
</feed>"#;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/browse-edgar"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .mount(&h.server)
            .await;
        mount_document(&h.server, "42", "0000000042-24-000002", "8-K").await;

        let completed = h
            .downloader
            .download_latest_filings(1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completed, 1);
        assert!(h.db.find("0000000042-24-000001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let h = harness(&["ownership"], |_| {}).await;

        let mut downloading = ProcessingRecord::new("0000000001-24-000001", "4", "1", Some(day()), "u");
        h.db.create_if_absent(&downloading).await.unwrap();
        downloading.mark_downloading().unwrap();
        h.db.update(&downloading, ProcessingStatus::Pending).await.unwrap();

        let mut downloaded = ProcessingRecord::new("0000000002-24-000002", "4", "2", Some(day()), "u");
        h.db.create_if_absent(&downloaded).await.unwrap();
        downloaded.mark_downloading().unwrap();
        h.db.update(&downloaded, ProcessingStatus::Pending).await.unwrap();
        downloaded.mark_downloaded().unwrap();
        h.db.update(&downloaded, ProcessingStatus::Downloading).await.unwrap();

        let recovered = h.downloader.recover_interrupted(Duration::ZERO).await.unwrap();
        assert_eq!(recovered, 2);

        for accession in ["0000000001-24-000001", "0000000002-24-000002"] {
            let record = h.db.find(accession).await.unwrap().unwrap();
            assert_eq!(record.status, ProcessingStatus::Failed);
            assert_eq!(record.retry_count, 1);
        }

        let jobs = h.db.recent_jobs(1).await.unwrap();
        assert_eq!(jobs[0].kind, "recover");
        assert_eq!(jobs[0].status, "completed");
        assert_eq!(jobs[0].files_downloaded, 2);
    }

    #[tokio::test]
    async fn test_failed_accession_fetch_is_retried() {
        let h = harness(&["ownership"], |_| {}).await;
        let accession = "0000950170-24-000001";
        let cancel = CancellationToken::new();

        // Nothing mounted yet, so the archive answers 404
        assert!(!h
            .downloader
            .download_by_accession(accession, &cancel)
            .await
            .unwrap());
        let failed = h.db.find(accession).await.unwrap().unwrap();
        assert_eq!(failed.status, ProcessingStatus::Failed);
        assert_eq!(failed.form_type, "");
        assert_eq!(failed.retry_count, 1);

        let stats = h.downloader.get_statistics().await.unwrap();
        assert_eq!(stats.counts.failed, 1);
        assert_eq!(stats.total, 1);

        mount_accession(&h.server, accession, "4").await;
        let retry = h.downloader.retry_failed_with_stats(3, &cancel).await.unwrap();
        assert_eq!(retry.eligible, 1);
        assert_eq!(retry.batch.completed, 1);

        let record = h.db.find(accession).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.form_type, "4");
        assert_eq!(h.downloader.get_statistics().await.unwrap().counts.completed, 1);
    }

    #[tokio::test]
    async fn test_accession_refetch_ignores_backoff() {
        let h = harness(&["ownership"], |config| {
            config.download.retry_base_backoff_secs = 60;
            config.download.retry_max_backoff_secs = 600;
        })
        .await;
        let accession = "0000950170-24-000001";
        let cancel = CancellationToken::new();

        assert!(!h
            .downloader
            .download_by_accession(accession, &cancel)
            .await
            .unwrap());
        mount_accession(&h.server, accession, "4").await;

        // Still inside the 60 s backoff, fetched anyway
        assert!(h
            .downloader
            .download_by_accession(accession, &cancel)
            .await
            .unwrap());
        assert_eq!(document_requests(&h.server).await, 2);

        let record = h.db.find(accession).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_accession_refetch_respects_retry_bound() {
        let h = harness(&["ownership"], |config| config.download.max_retries = 1).await;
        let accession = "0000950170-24-000001";
        let cancel = CancellationToken::new();

        assert!(!h
            .downloader
            .download_by_accession(accession, &cancel)
            .await
            .unwrap());
        mount_accession(&h.server, accession, "4").await;

        assert!(!h
            .downloader
            .download_by_accession(accession, &cancel)
            .await
            .unwrap());
        assert_eq!(document_requests(&h.server).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_fetch_each_filing_once() {
        let h = harness(&["ownership"], |config| config.download.workers = 4).await;
        let filings: Vec<(String, String)> = (1..=8)
            .map(|i| (format!("{}", 100 + i), format!("0000000{}-24-000001", 100 + i)))
            .collect();
        let lines: Vec<(&str, &str, &str)> = filings
            .iter()
            .map(|(entity, accession)| (entity.as_str(), "4", accession.as_str()))
            .collect();
        mount_daily_index(&h.server, day(), index_for(day(), &lines)).await;
        for (entity, accession) in &filings {
            mount_document(&h.server, entity, accession, "4").await;
        }

        let cancel = CancellationToken::new();
        let (first, second) = tokio::join!(
            h.downloader.download_for_date(day(), &cancel),
            h.downloader.download_for_date(day(), &cancel)
        );
        assert_eq!(first.unwrap() + second.unwrap(), 8);
        assert_eq!(document_requests(&h.server).await, 8);

        let stats = h.downloader.get_statistics().await.unwrap();
        assert_eq!(stats.counts.completed, 8);
        assert_eq!(stats.total, 8);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_keeps_started_work() {
        let h = harness(&["ownership"], |config| config.download.workers = 2).await;
        let filings = [
            ("101", "0000000101-24-000001"),
            ("102", "0000000102-24-000001"),
            ("103", "0000000103-24-000001"),
            ("104", "0000000104-24-000001"),
        ];
        let lines: Vec<_> = filings.iter().map(|(e, a)| (*e, "4", *a)).collect();
        mount_daily_index(&h.server, day(), index_for(day(), &lines)).await;
        for (entity, accession) in filings {
            Mock::given(method("GET"))
                .and(path(format!("/Archives/edgar/data/{}/{}.txt", entity, accession)))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(sample_submission(accession, "4"))
                        .set_delay(Duration::from_millis(300)),
                )
                .mount(&h.server)
                .await;
        }

        let cancel = CancellationToken::new();
        let run = {
            let downloader = h.downloader.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { downloader.download_for_date(day(), &cancel).await })
        };
        wait_for_document_requests(&h.server, 2).await;
        cancel.cancel();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // The two started filings finished; no further filing was started
        assert_eq!(document_requests(&h.server).await, 2);
        for (_, accession) in &filings[..2] {
            let record = h.db.find(accession).await.unwrap().unwrap();
            assert_eq!(record.status, ProcessingStatus::Completed);
        }
        for (_, accession) in &filings[2..] {
            assert!(h.db.find(accession).await.unwrap().is_none());
        }

        let jobs = h.db.recent_jobs(1).await.unwrap();
        assert_eq!(jobs[0].status, "cancelled");
        assert_eq!(jobs[0].files_downloaded, 2);
    }

    #[tokio::test]
    async fn test_failure_on_moved_record_is_busy() {
        let h = harness(&["ownership"], |_| {}).await;
        let mut record = ProcessingRecord::new("0000000001-24-000001", "4", "1", Some(day()), "u");
        h.db.create_if_absent(&record).await.unwrap();
        record.mark_downloading().unwrap();
        h.db.update(&record, ProcessingStatus::Pending).await.unwrap();

        // Recovery moves the record while this copy is still DOWNLOADING
        assert_eq!(h.downloader.recover_interrupted(Duration::ZERO).await.unwrap(), 1);

        let outcome = h
            .downloader
            .fail(record, Error::Parse("truncated".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, ItemOutcome::Busy);

        let stored = h.db.find("0000000001-24-000001").await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.failure_kind, Some(crate::error::FailureKind::Cancelled));
    }
}
