//! Configuration management for filingsync
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::archive::validate_user_agent;
use crate::error::{Error, Result};
use crate::filing::BUILTIN_KIND_TAGS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream archive settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Shared request budget
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Download orchestrator tunables
    #[serde(default)]
    pub download: DownloadConfig,

    /// Gap detection and backfill
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Processing record retention
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Scheduled jobs
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Upstream archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive
    #[serde(default = "default_archive_base_url")]
    pub base_url: String,

    /// Descriptive client identifier sent on every request
    #[serde(default = "default_archive_user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "default_archive_timeout")]
    pub timeout_secs: u64,

    /// Body markers that identify a blocked request
    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
}

/// Rate limit: at most `max_requests` per `period_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_rate_limit_period_ms")]
    pub period_ms: u64,
}

/// Download orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Filing kinds to ingest (`ownership`, `current-report`, ...)
    #[serde(default = "default_download_kinds")]
    pub kinds: Vec<String>,

    /// Concurrent filings within one run
    #[serde(default = "default_download_workers")]
    pub workers: usize,

    /// Extra delay between filings, on top of the rate limit
    #[serde(default = "default_download_item_delay_ms")]
    pub item_delay_ms: u64,

    /// Failed records are retried until retry_count reaches this value
    #[serde(default = "default_download_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_backoff_secs")]
    pub retry_base_backoff_secs: u64,

    #[serde(default = "default_retry_max_backoff_secs")]
    pub retry_max_backoff_secs: u64,

    #[serde(default = "default_blocked_backoff_multiplier")]
    pub blocked_backoff_multiplier: u32,

    /// Entries requested from the latest-filings feed
    #[serde(default = "default_latest_count")]
    pub latest_count: usize,

    /// First year loaded by `sync history`
    #[serde(default = "default_history_start_year")]
    pub history_start_year: i32,
}

/// Backfill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Rolling window inspected by auto-backfill
    #[serde(default = "default_backfill_window_days")]
    pub window_days: u32,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Records older than this are removed by cleanup
    #[serde(default = "default_retention_max_age_days")]
    pub max_age_days: u32,
}

/// A single scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_enabled")]
    pub enabled: bool,

    pub interval_secs: u64,
}

impl JobConfig {
    fn with_interval(interval_secs: u64) -> Self {
        Self {
            enabled: default_job_enabled(),
            interval_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// All scheduled jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "JobsConfig::default_sync_filings")]
    pub sync_filings: JobConfig,

    #[serde(default = "JobsConfig::default_sync_tickers")]
    pub sync_tickers: JobConfig,

    #[serde(default = "JobsConfig::default_retry_failed")]
    pub retry_failed: JobConfig,

    #[serde(default = "JobsConfig::default_auto_backfill")]
    pub auto_backfill: JobConfig,

    #[serde(default = "JobsConfig::default_cleanup")]
    pub cleanup: JobConfig,
}

impl JobsConfig {
    fn default_sync_filings() -> JobConfig {
        JobConfig::with_interval(default_sync_filings_interval())
    }

    fn default_sync_tickers() -> JobConfig {
        JobConfig::with_interval(default_sync_tickers_interval())
    }

    fn default_retry_failed() -> JobConfig {
        JobConfig::with_interval(default_retry_failed_interval())
    }

    fn default_auto_backfill() -> JobConfig {
        JobConfig::with_interval(default_auto_backfill_interval())
    }

    fn default_cleanup() -> JobConfig {
        JobConfig::with_interval(default_cleanup_interval())
    }

    /// Iterate jobs with their scheduler names
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &JobConfig)> {
        [
            ("sync-filings", &self.sync_filings),
            ("sync-tickers", &self.sync_tickers),
            ("retry-failed", &self.retry_failed),
            ("auto-backfill", &self.auto_backfill),
            ("cleanup", &self.cleanup),
        ]
        .into_iter()
    }
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for filingsync data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_archive_base_url(),
            user_agent: default_archive_user_agent(),
            timeout_secs: default_archive_timeout(),
            block_markers: default_block_markers(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max_requests(),
            period_ms: default_rate_limit_period_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            kinds: default_download_kinds(),
            workers: default_download_workers(),
            item_delay_ms: default_download_item_delay_ms(),
            max_retries: default_download_max_retries(),
            retry_base_backoff_secs: default_retry_base_backoff_secs(),
            retry_max_backoff_secs: default_retry_max_backoff_secs(),
            blocked_backoff_multiplier: default_blocked_backoff_multiplier(),
            latest_count: default_latest_count(),
            history_start_year: default_history_start_year(),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_days: default_backfill_window_days(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_retention_max_age_days(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            sync_filings: Self::default_sync_filings(),
            sync_tickers: Self::default_sync_tickers(),
            retry_failed: Self::default_retry_failed(),
            auto_backfill: Self::default_auto_backfill(),
            cleanup: Self::default_cleanup(),
        }
    }
}

impl Config {
    /// Get the default base directory for filingsync (~/.filingsync)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".filingsync")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("filings.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("filings.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.archive.base_url)?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(Error::Config(
                "archive.base_url must be an http(s) URL".to_string(),
            ));
        }

        validate_user_agent(&self.archive.user_agent)
            .map_err(|e| Error::Config(format!("archive.user_agent: {}", e)))?;

        if self.rate_limit.max_requests == 0 || self.rate_limit.period_ms == 0 {
            return Err(Error::Config(
                "rate_limit.max_requests and rate_limit.period_ms must be positive".to_string(),
            ));
        }

        if self.download.workers == 0 {
            return Err(Error::Config("download.workers must be >= 1".to_string()));
        }

        if self.download.kinds.is_empty() {
            return Err(Error::Config(
                "download.kinds must name at least one filing kind".to_string(),
            ));
        }

        for kind in &self.download.kinds {
            if !BUILTIN_KIND_TAGS.contains(&kind.as_str()) {
                return Err(Error::UnknownKind(kind.clone()));
            }
        }

        for (name, job) in self.jobs.iter() {
            if job.enabled && job.interval_secs == 0 {
                return Err(Error::Config(format!(
                    "jobs.{} interval_secs must be positive",
                    name.replace('-', "_")
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.download.kinds, vec!["ownership".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.download.max_retries = 7;
        config.jobs.sync_tickers.enabled = false;

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.download.max_retries, 7);
        assert!(!loaded.jobs.sync_tickers.enabled);
        assert_eq!(loaded.paths.db_file, tmp.path().join("filings.db"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rate_limit]
            max_requests = 5

            [jobs.cleanup]
            enabled = false
            interval_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.period_ms, 1000);
        assert!(!config.jobs.cleanup.enabled);
        assert_eq!(
            config.jobs.sync_filings.interval_secs,
            default_sync_filings_interval()
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.archive.user_agent = "curl".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.download.kinds = vec!["horoscopes".to_string()];
        assert!(matches!(config.validate(), Err(Error::UnknownKind(_))));

        let mut config = Config::default();
        config.jobs.retry_failed.interval_secs = 0;
        assert!(config.validate().is_err());
        config.jobs.retry_failed.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.archive.base_url = "ftp://archive.example".to_string();
        assert!(config.validate().is_err());
    }
}
