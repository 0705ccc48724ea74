//! Master index discovery
//!
//! Finds which filings exist for a day or a quarter without downloading the
//! filings themselves.

use super::client::ArchiveClient;
use super::feed::parse_atom_feed;
use super::index::{IndexListing, MasterIndexEntry};
use crate::error::{Error, Result};
use chrono::{Datelike, NaiveDate, Utc};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Today's date as the archive's calendar sees it
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// A calendar quarter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quarter {
    pub year: i32,
    pub quarter: u32,
}

impl Quarter {
    pub fn new(year: i32, quarter: u32) -> Result<Self> {
        if !(1..=4).contains(&quarter) {
            return Err(Error::Validation(format!(
                "Quarter must be 1-4, got {}",
                quarter
            )));
        }
        Ok(Self { year, quarter })
    }

    /// Quarter containing a date
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
        }
    }

    pub fn next(self) -> Self {
        if self.quarter == 4 {
            Self {
                year: self.year + 1,
                quarter: 1,
            }
        } else {
            Self {
                year: self.year,
                quarter: self.quarter + 1,
            }
        }
    }
}

impl std::fmt::Display for Quarter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} QTR{}", self.year, self.quarter)
    }
}

/// Every quarter from Q1 of `start_year` through the quarter containing `today`
pub fn quarters_since(start_year: i32, today: NaiveDate) -> impl Iterator<Item = Quarter> {
    let last = Quarter::of(today);
    std::iter::successors(Some(Quarter { year: start_year, quarter: 1 }), |q| Some(q.next()))
        .take_while(move |q| *q <= last)
}

/// Master index crawler
#[derive(Clone)]
pub struct MasterIndexCrawler {
    client: Arc<ArchiveClient>,
}

impl MasterIndexCrawler {
    pub fn new(client: Arc<ArchiveClient>) -> Self {
        Self { client }
    }

    /// Canonical path first, quarter-nested path second
    pub fn daily_index_urls(&self, date: NaiveDate) -> [String; 2] {
        let stamp = date.format("%Y%m%d");
        let quarter = Quarter::of(date);
        [
            format!(
                "{}/Archives/edgar/daily-index/master.{}.idx",
                self.client.base_url(),
                stamp
            ),
            format!(
                "{}/Archives/edgar/daily-index/{}/QTR{}/master.{}.idx",
                self.client.base_url(),
                quarter.year,
                quarter.quarter,
                stamp
            ),
        ]
    }

    pub fn quarterly_index_url(&self, quarter: Quarter) -> String {
        format!(
            "{}/Archives/edgar/full-index/{}/QTR{}/master.gz",
            self.client.base_url(),
            quarter.year,
            quarter.quarter
        )
    }

    /// Fetch the daily index for `date`.
    ///
    /// Future dates fail validation without touching the network. When no
    /// candidate URL yields usable content the result is `NotAvailable`,
    /// which is routine for weekends and holidays.
    pub async fn fetch_daily_index(
        &self,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<IndexListing> {
        if date > today() {
            return Err(Error::Validation(format!(
                "Cannot fetch the daily index for future date {}",
                date
            )));
        }

        for url in self.daily_index_urls(date) {
            let permit = self.client.permit(cancel).await?;
            match self.client.get_text(permit, &url).await {
                Ok(content) => match IndexListing::new(url.as_str(), content) {
                    Ok(listing) => {
                        debug!("Daily index for {} from {}", date, url);
                        return Ok(listing);
                    }
                    Err(e) => warn!("Unusable daily index at {}: {}", url, e),
                },
                Err(Error::Blocked { .. }) => {
                    warn!(event = "archive_blocked", %date, url = %url, "Daily index candidate blocked");
                }
                Err(e) => debug!("Daily index candidate {} failed: {}", url, e),
            }
        }

        Err(Error::NotAvailable(format!("No daily index published for {}", date)))
    }

    /// Fetch and decompress the quarterly index
    pub async fn fetch_quarterly_index(
        &self,
        quarter: Quarter,
        cancel: &CancellationToken,
    ) -> Result<IndexListing> {
        if quarter > Quarter::of(today()) {
            return Err(Error::Validation(format!(
                "Cannot fetch the index for future quarter {}",
                quarter
            )));
        }

        let url = self.quarterly_index_url(quarter);
        let permit = self.client.permit(cancel).await?;
        let compressed = self.client.get_bytes(permit, &url).await?;
        let content = tokio::task::spawn_blocking(move || gunzip(&compressed))
            .await
            .map_err(|e| Error::Other(format!("Decompression task failed: {}", e)))??;

        info!("Fetched quarterly index for {} ({} bytes)", quarter, content.len());
        IndexListing::new(url, content)
    }

    /// Recent filings of one form type from the live feed
    pub async fn fetch_latest(
        &self,
        form_type: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<MasterIndexEntry>> {
        let count = count.to_string();
        let url = Url::parse_with_params(
            &format!("{}/cgi-bin/browse-edgar", self.client.base_url()),
            &[
                ("action", "getcurrent"),
                ("type", form_type),
                ("company", ""),
                ("dateb", ""),
                ("owner", "include"),
                ("start", "0"),
                ("count", count.as_str()),
                ("output", "atom"),
            ],
        )?;

        let permit = self.client.permit(cancel).await?;
        let content = self.client.get_text(permit, url.as_str()).await?;
        let entries = parse_atom_feed(&content);
        debug!("Latest feed for {}: {} entries", form_type, entries.len());
        Ok(entries)
    }
}

fn gunzip(bytes: &[u8]) -> Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::Parse(format!("Corrupt gzip index: {}", e)))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::RateLimiter;
    use crate::config::ArchiveConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INDEX: &str = "Description: Daily Index\n\
Last Data Received: January 2, 2024\n\
CIK|Company Name|Form Type|Date Filed|File Name\n\
--------------------------------------------------------------------------------\n\
1000045|NICHOLAS FINANCIAL INC|4|20240102|edgar/data/1000045/0000950170-24-000001.txt\n\
1000180|SANDISK CORP|8-K|20240102|edgar/data/1000180/0001000180-24-000003.txt\n";

    fn crawler_for(server: &MockServer) -> MasterIndexCrawler {
        let config = ArchiveConfig {
            base_url: server.uri(),
            ..ArchiveConfig::default()
        };
        let client =
            ArchiveClient::new(&config, RateLimiter::new(1000, Duration::from_secs(1))).unwrap();
        MasterIndexCrawler::new(Arc::new(client))
    }

    #[tokio::test]
    async fn test_future_date_rejected_without_requests() {
        let server = MockServer::start().await;
        let crawler = crawler_for(&server);
        let tomorrow = today().succ_opt().unwrap();

        let result = crawler
            .fetch_daily_index(tomorrow, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_candidate_falls_back_to_second_url() {
        let server = MockServer::start().await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        Mock::given(method("GET"))
            .and(path("/Archives/edgar/daily-index/master.20240102.idx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "Request Rate Threshold Exceeded\n----------\n1|X|4|20240102|edgar/data/1/0000000001-24-000009.txt\n",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Archives/edgar/daily-index/2024/QTR1/master.20240102.idx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .expect(1)
            .mount(&server)
            .await;

        let listing = crawler_for(&server)
            .fetch_daily_index(date, &CancellationToken::new())
            .await
            .unwrap();
        let entries: Vec<_> = listing.entries().collect::<Result<_>>().unwrap();

        assert!(listing.source_url().ends_with("/2024/QTR1/master.20240102.idx"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entity_id, "1000045");
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let server = MockServer::start().await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        Mock::given(method("GET"))
            .and(path("/Archives/edgar/daily-index/master.20240102.idx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Archives/edgar/daily-index/2024/QTR1/master.20240102.idx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .expect(0)
            .mount(&server)
            .await;

        let listing = crawler_for(&server)
            .fetch_daily_index(date, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(listing.entries().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_index_is_not_available() {
        let server = MockServer::start().await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();

        let result = crawler_for(&server)
            .fetch_daily_index(date, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::NotAvailable(_))));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_quarterly_index_is_decompressed() {
        let server = MockServer::start().await;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(INDEX.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();

        Mock::given(method("GET"))
            .and(path("/Archives/edgar/full-index/2024/QTR1/master.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(gz, "application/x-gzip"))
            .mount(&server)
            .await;

        let listing = crawler_for(&server)
            .fetch_quarterly_index(Quarter::new(2024, 1).unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(listing.entries().count(), 2);
    }

    #[tokio::test]
    async fn test_future_quarter_rejected() {
        let server = MockServer::start().await;
        let next = Quarter::of(today()).next();
        let result = crawler_for(&server)
            .fetch_quarterly_index(next, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_quarters_since() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let quarters: Vec<_> = quarters_since(2023, today).collect();
        assert_eq!(quarters.len(), 6);
        assert_eq!(quarters[0], Quarter { year: 2023, quarter: 1 });
        assert_eq!(quarters[5], Quarter { year: 2024, quarter: 2 });
        assert_eq!(quarters_since(2025, today).count(), 0);
        assert!(Quarter::new(2024, 5).is_err());
    }
}
