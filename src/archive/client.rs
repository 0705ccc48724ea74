//! HTTP access to the archive

use super::index::filer_id_from_accession;
use super::rate_limit::{RateLimiter, RatePermit};
use crate::config::{ArchiveConfig, Config};
use crate::error::{Error, Result};
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Check the `name/version (organisation; contact[; ...])` shape the archive
/// expects from automated clients.
pub fn validate_user_agent(user_agent: &str) -> Result<()> {
    let re = Regex::new(r"^[^\s/()]+/[^\s/()]+ \([^;()]*[^;()\s][^;()]*(;[^;()]*[^;()\s][^;()]*)+\)$")
        .map_err(|e| Error::Other(e.to_string()))?;
    if re.is_match(user_agent.trim()) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Client identifier must look like 'name/version (organisation; contact)': {:?}",
            user_agent
        )))
    }
}

/// Rate-limited archive client
pub struct ArchiveClient {
    client: Client,
    base_url: String,
    block_markers: Vec<String>,
    limiter: RateLimiter,
}

impl ArchiveClient {
    /// Build a client; a malformed client identifier is rejected here,
    /// before any request can be sent
    pub fn new(config: &ArchiveConfig, limiter: RateLimiter) -> Result<Self> {
        validate_user_agent(&config.user_agent)?;

        let client = Client::builder()
            .user_agent(config.user_agent.trim())
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            block_markers: config.block_markers.clone(),
            limiter,
        })
    }

    /// Client with its own limiter built from `[rate_limit]`
    pub fn from_config(config: &Config) -> Result<Self> {
        let limiter = RateLimiter::new(config.rate_limit.max_requests, config.rate_limit.period());
        Self::new(&config.archive, limiter)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Take one unit of the shared request budget
    pub async fn permit(&self, cancel: &CancellationToken) -> Result<RatePermit> {
        self.limiter.acquire(cancel).await
    }

    /// Absolute URL for a path relative to the archive root (`edgar/data/...`)
    pub fn archive_url(&self, relative: &str) -> String {
        if relative.starts_with("http://") || relative.starts_with("https://") {
            return relative.to_string();
        }
        format!(
            "{}/Archives/{}",
            self.base_url,
            relative.trim_start_matches('/')
        )
    }

    /// Full-submission text URL for a bare accession number
    pub fn accession_url(&self, accession: &str) -> Result<String> {
        let filer = filer_id_from_accession(accession)
            .ok_or_else(|| Error::Validation(format!("Invalid accession number: {}", accession)))?;
        Ok(format!(
            "{}/Archives/edgar/data/{}/{}/{}.txt",
            self.base_url,
            filer,
            accession.replace('-', ""),
            accession
        ))
    }

    /// GET a URL as text
    pub async fn get_text(&self, permit: RatePermit, url: &str) -> Result<String> {
        let body = self.get_bytes(permit, url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// GET a URL; non-2xx, empty, and blocked responses are errors
    pub async fn get_bytes(&self, _permit: RatePermit, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?.to_vec();
        if body.is_empty() {
            return Err(Error::NotAvailable(format!("Empty response: {}", url)));
        }

        if self.is_blocked(&body) {
            warn!(event = "archive_blocked", url = %url, "Archive blocked the request");
            return Err(Error::Blocked {
                url: url.to_string(),
            });
        }

        Ok(body)
    }

    fn is_blocked(&self, body: &[u8]) -> bool {
        if body.starts_with(&GZIP_MAGIC) {
            return false;
        }
        let text = String::from_utf8_lossy(body);
        self.block_markers
            .iter()
            .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
    }
}
