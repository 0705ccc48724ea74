//! Default values for configuration

/// Default archive base URL
pub fn default_archive_base_url() -> String {
    std::env::var("FILINGSYNC_ARCHIVE_URL").unwrap_or_else(|_| "https://www.sec.gov".to_string())
}

/// Default client identifier; the archive expects a name and a contact
pub fn default_archive_user_agent() -> String {
    format!(
        "filingsync/{} (filingsync operator; ops@example.com)",
        env!("CARGO_PKG_VERSION")
    )
}

/// Default request timeout in seconds
pub fn default_archive_timeout() -> u64 {
    30
}

/// Response markers that mean the archive refused the request
pub fn default_block_markers() -> Vec<String> {
    vec![
        "Undeclared Automated Tool".to_string(),
        "Request Rate Threshold Exceeded".to_string(),
    ]
}

/// Default request budget per period
pub fn default_rate_limit_max_requests() -> u32 {
    10
}

/// Default rate-limit period (1 second)
pub fn default_rate_limit_period_ms() -> u64 {
    1000
}

/// Default filing kinds to ingest
pub fn default_download_kinds() -> Vec<String> {
    vec!["ownership".to_string()]
}

/// Default worker count within one run (sequential)
pub fn default_download_workers() -> usize {
    1
}

/// Default extra delay between items
pub fn default_download_item_delay_ms() -> u64 {
    0
}

/// Default retry ceiling
pub fn default_download_max_retries() -> u32 {
    3
}

/// Default first retry backoff (1 minute)
pub fn default_retry_base_backoff_secs() -> u64 {
    60
}

/// Default backoff cap (6 hours)
pub fn default_retry_max_backoff_secs() -> u64 {
    6 * 60 * 60
}

/// Blocked failures wait this many times longer
pub fn default_blocked_backoff_multiplier() -> u32 {
    4
}

/// Default entries requested from the latest-filings feed
pub fn default_latest_count() -> usize {
    100
}

/// Default first year for quarterly history loads
pub fn default_history_start_year() -> i32 {
    2020
}

/// Default auto-backfill window (two weeks)
pub fn default_backfill_window_days() -> u32 {
    14
}

/// Default record retention (one year)
pub fn default_retention_max_age_days() -> u32 {
    365
}

/// Default: job enabled
pub fn default_job_enabled() -> bool {
    true
}

/// Default filing sync interval (15 minutes)
pub fn default_sync_filings_interval() -> u64 {
    15 * 60
}

/// Default ticker sync interval (daily)
pub fn default_sync_tickers_interval() -> u64 {
    24 * 60 * 60
}

/// Default retry interval (hourly)
pub fn default_retry_failed_interval() -> u64 {
    60 * 60
}

/// Default auto-backfill interval (every 6 hours)
pub fn default_auto_backfill_interval() -> u64 {
    6 * 60 * 60
}

/// Default retention cleanup interval (daily)
pub fn default_cleanup_interval() -> u64 {
    24 * 60 * 60
}
