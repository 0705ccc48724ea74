//! Company ticker synchronisation

use crate::archive::ArchiveClient;
use crate::error::{Error, Result};
use crate::meta::{format_timestamp, MetaDb, Ticker};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One entry of `company_tickers.json`
#[derive(Debug, Deserialize)]
struct TickerEntry {
    cik_str: u64,
    ticker: String,
    title: String,
}

/// Refreshes the `tickers` table from the archive's ticker file
pub struct TickerSync {
    client: Arc<ArchiveClient>,
    db: MetaDb,
}

impl TickerSync {
    pub fn new(client: Arc<ArchiveClient>, db: MetaDb) -> Self {
        Self { client, db }
    }

    pub fn source_url(&self) -> String {
        format!("{}/files/company_tickers.json", self.client.base_url())
    }

    /// Fetch the ticker file and upsert every entry. Returns the row count.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<usize> {
        let url = self.source_url();
        let permit = self.client.permit(cancel).await?;
        let body = self.client.get_bytes(permit, &url).await?;

        let tickers = parse_tickers(&body)?;
        debug!("Parsed {} tickers from {}", tickers.len(), url);

        let count = self.db.upsert_tickers(&tickers).await?;
        info!(tickers = count, "Ticker sync finished");
        Ok(count)
    }
}

/// `{"0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."}, ...}`
fn parse_tickers(body: &[u8]) -> Result<Vec<Ticker>> {
    let entries: BTreeMap<String, TickerEntry> = serde_json::from_slice(body)
        .map_err(|e| Error::Parse(format!("Malformed ticker file: {}", e)))?;

    let updated_at = format_timestamp(Utc::now());
    Ok(entries
        .into_values()
        .filter(|e| !e.ticker.trim().is_empty())
        .map(|e| Ticker {
            ticker: e.ticker.trim().to_uppercase(),
            entity_id: e.cik_str.to_string(),
            title: e.title.trim().to_string(),
            updated_at: updated_at.clone(),
        })
        .collect())
}
