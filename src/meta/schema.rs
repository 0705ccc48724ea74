//! SQLite schema definition

/// SQL schema for the metadata database
pub const SCHEMA_SQL: &str = r#"
-- Processing records: one per filing, the primary key is the dedup guard
CREATE TABLE IF NOT EXISTS processing_records (
    accession_number TEXT PRIMARY KEY,
    form_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    filing_date TEXT,
    status TEXT NOT NULL,
    source_url TEXT NOT NULL,
    error_message TEXT,
    failure_kind TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_attempt_at TEXT,
    download_started_at TEXT,
    processed_at TEXT,
    processing_duration_ms INTEGER
);

-- Download jobs: one per orchestrator run
CREATE TABLE IF NOT EXISTS download_jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    files_downloaded INTEGER NOT NULL DEFAULT 0,
    total_files INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT
);

-- Filings: parser output
CREATE TABLE IF NOT EXISTS filings (
    accession_number TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    form_type TEXT NOT NULL,
    filed_date TEXT,
    company_name TEXT,
    filers_json TEXT NOT NULL,
    document_count INTEGER,
    stored_at TEXT NOT NULL
);

-- Tickers: entity id to exchange symbol
CREATE TABLE IF NOT EXISTS tickers (
    ticker TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    title TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_records_status ON processing_records(status);
CREATE INDEX IF NOT EXISTS idx_records_form_date ON processing_records(form_type, filing_date);
CREATE INDEX IF NOT EXISTS idx_records_created ON processing_records(created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_started ON download_jobs(started_at);
CREATE INDEX IF NOT EXISTS idx_tickers_entity ON tickers(entity_id);
"#;
