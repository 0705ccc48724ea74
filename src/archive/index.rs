//! Master index parsing
//!
//! Daily and quarterly master indexes share one layout: a free-form header
//! block, a dashed delimiter line, then one pipe-delimited line per filing:
//!
//! ```text
//! CIK|Company Name|Form Type|Date Filed|Filename
//! --------------------------------------------------------------------------------
//! 1000045|NICHOLAS FINANCIAL INC|4|20240102|edgar/data/1000045/0000950170-24-000001.txt
//! ```

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One line of a master index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterIndexEntry {
    pub entity_id: String,
    pub entity_name: String,
    pub form_type: String,
    pub date_filed: NaiveDate,
    pub document_link: String,
}

impl MasterIndexEntry {
    /// Accession number encoded in the document link's file name
    pub fn accession_number(&self) -> Option<String> {
        accession_from_link(&self.document_link)
    }

    /// Required fields present and the link carries an accession number
    pub fn validate(&self) -> std::result::Result<String, String> {
        if self.entity_id.trim().is_empty() {
            return Err("missing entity id".to_string());
        }
        if self.form_type.trim().is_empty() {
            return Err("missing form type".to_string());
        }
        if self.document_link.trim().is_empty() {
            return Err("missing document link".to_string());
        }
        self.accession_number()
            .ok_or_else(|| format!("no accession number in link {}", self.document_link))
    }
}

/// `0000950170-24-000001` style identifier: filer id, year, sequence
pub fn is_valid_accession(accession: &str) -> bool {
    let bytes = accession.as_bytes();
    bytes.len() == 20
        && bytes.iter().enumerate().all(|(i, b)| match i {
            10 | 13 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Pull the accession number out of a document path or URL
pub fn accession_from_link(link: &str) -> Option<String> {
    let file = link.trim().rsplit('/').next()?;
    let stem = file.split('.').next()?;
    let stem = stem.strip_suffix("-index").unwrap_or(stem);
    if is_valid_accession(stem) {
        Some(stem.to_string())
    } else {
        None
    }
}

/// Filer id embedded in an accession prefix, without leading zeros
pub fn filer_id_from_accession(accession: &str) -> Option<String> {
    if !is_valid_accession(accession) {
        return None;
    }
    let prefix = &accession[..10];
    let trimmed = prefix.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed }.to_string())
}

/// Parse an index date (`YYYYMMDD`, or `YYYY-MM-DD` in older quarterly files)
pub fn parse_index_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| Error::Parse(format!("Invalid index date: {}", raw)))
}

/// Parse one data line
pub fn parse_index_line(line: &str) -> Result<MasterIndexEntry> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 5 {
        return Err(Error::Parse(format!(
            "Expected 5 fields, found {}: {}",
            fields.len(),
            line
        )));
    }

    Ok(MasterIndexEntry {
        entity_id: fields[0].trim().to_string(),
        entity_name: fields[1].trim().to_string(),
        form_type: fields[2].trim().to_string(),
        date_filed: parse_index_date(fields[3])?,
        document_link: fields[4].trim().to_string(),
    })
}

fn is_delimiter(line: &str) -> bool {
    let line = line.trim();
    line.len() >= 3 && line.chars().all(|c| c == '-')
}

/// A fetched index file. Entries are parsed lazily and can be iterated any
/// number of times.
#[derive(Debug, Clone)]
pub struct IndexListing {
    source_url: String,
    content: String,
    body_start: usize,
}

impl IndexListing {
    /// Locate the header delimiter; content without one is not an index
    pub fn new(source_url: impl Into<String>, content: String) -> Result<Self> {
        let source_url = source_url.into();
        let mut offset = 0;
        for line in content.split_inclusive('\n') {
            offset += line.len();
            if is_delimiter(line) {
                return Ok(Self {
                    source_url,
                    content,
                    body_start: offset,
                });
            }
        }
        Err(Error::Parse(format!(
            "No header delimiter in index from {}",
            source_url
        )))
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Every data line, in file order
    pub fn entries(&self) -> impl Iterator<Item = Result<MasterIndexEntry>> + '_ {
        self.content[self.body_start..]
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(parse_index_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Description:           Daily Index of EDGAR Dissemination Feed by Company Name\n\
Last Data Received:    January 2, 2024\n\
CIK|Company Name|Form Type|Date Filed|File Name\n\
--------------------------------------------------------------------------------\n\
1000045|NICHOLAS FINANCIAL INC|4|20240102|edgar/data/1000045/0000950170-24-000001.txt\n\
1000180|SANDISK CORP|8-K|20240102|edgar/data/1000180/0001000180-24-000003.txt\n";

    #[test]
    fn test_parse_daily_index() {
        let listing = IndexListing::new("https://archive.test/x", SAMPLE.to_string()).unwrap();
        let entries: Vec<_> = listing.entries().collect::<Result<_>>().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entity_id, "1000045");
        assert_eq!(entries[0].entity_name, "NICHOLAS FINANCIAL INC");
        assert_eq!(entries[0].form_type, "4");
        assert_eq!(
            entries[0].date_filed,
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        );
        assert_eq!(
            entries[1].document_link,
            "edgar/data/1000180/0001000180-24-000003.txt"
        );
        assert_eq!(
            entries[1].accession_number().as_deref(),
            Some("0001000180-24-000003")
        );
    }

    #[test]
    fn test_entries_are_restartable() {
        let listing = IndexListing::new("u", SAMPLE.to_string()).unwrap();
        assert_eq!(listing.entries().count(), 2);
        assert_eq!(listing.entries().count(), 2);
    }

    #[test]
    fn test_missing_delimiter_is_parse_error() {
        let result = IndexListing::new("u", "just some text\nno dashes\n".to_string());
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_malformed_line_is_isolated() {
        let content = format!("{}broken line without pipes\n", SAMPLE);
        let listing = IndexListing::new("u", content).unwrap();
        let results: Vec<_> = listing.entries().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(Error::Parse(_))));
    }

    #[test]
    fn test_quarterly_dash_dates() {
        let entry =
            parse_index_line("320193|Apple Inc.|10-K|2023-11-03|edgar/data/320193/0000320193-23-000106.txt")
                .unwrap();
        assert_eq!(
            entry.date_filed,
            NaiveDate::from_ymd_opt(2023, 11, 3).unwrap()
        );
    }

    #[test]
    fn test_accession_helpers() {
        assert!(is_valid_accession("0000950170-24-000001"));
        assert!(!is_valid_accession("950170-24-1"));
        assert_eq!(
            accession_from_link("https://x/Archives/edgar/data/1/000095017024000001/0000950170-24-000001-index.htm")
                .as_deref(),
            Some("0000950170-24-000001")
        );
        assert_eq!(accession_from_link("edgar/data/1/readme.txt"), None);
        assert_eq!(
            filer_id_from_accession("0000950170-24-000001").as_deref(),
            Some("950170")
        );
    }

    #[test]
    fn test_entry_validation() {
        let mut entry = parse_index_line(
            "1000045|NICHOLAS FINANCIAL INC|4|20240102|edgar/data/1000045/0000950170-24-000001.txt",
        )
        .unwrap();
        assert_eq!(entry.validate().unwrap(), "0000950170-24-000001");

        entry.form_type = " ".to_string();
        assert!(entry.validate().is_err());
    }
}
