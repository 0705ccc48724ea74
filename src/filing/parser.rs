//! Parser boundary and the submission-header parser
//!
//! Every full-submission text file starts with an SGML header block:
//!
//! ```text
//! <SEC-HEADER>0000950170-24-000001.hdr.sgml : 20240102
//! ACCESSION NUMBER:		0000950170-24-000001
//! CONFORMED SUBMISSION TYPE:	4
//! PUBLIC DOCUMENT COUNT:		1
//! FILED AS OF DATE:		20240102
//! REPORTING-OWNER:
//! 	OWNER DATA:
//! 		COMPANY CONFORMED NAME:	Doe John
//! 		CENTRAL INDEX KEY:	0001234567
//! </SEC-HEADER>
//! ```
//!
//! Form-specific content parsing is left to other `FilingParser`
//! implementations.

use crate::archive::parse_index_date;
use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Turns a downloaded document into structured fields
pub trait FilingParser: Send + Sync {
    fn parse(&self, accession: &str, content: &[u8]) -> Result<ParsedFiling>;
}

/// One company or person named in a filing header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filer {
    /// Header section the filer appeared under (`ISSUER`, `REPORTING-OWNER`, ...)
    pub role: Option<String>,
    pub name: String,
    pub entity_id: String,
}

/// Structured output of a parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFiling {
    pub accession_number: String,
    pub form_type: String,
    pub filed_date: Option<NaiveDate>,
    pub period_of_report: Option<NaiveDate>,
    pub document_count: Option<u32>,
    pub filers: Vec<Filer>,
}

impl ParsedFiling {
    /// Name of the subject company, falling back to the first filer
    pub fn company_name(&self) -> Option<&str> {
        const SUBJECT_ROLES: [&str; 3] = ["ISSUER", "SUBJECT COMPANY", "FILER"];
        self.filers
            .iter()
            .find(|f| {
                f.role
                    .as_deref()
                    .is_some_and(|role| SUBJECT_ROLES.contains(&role))
            })
            .or_else(|| self.filers.first())
            .map(|f| f.name.as_str())
    }
}

/// Reads the submission header common to every filing type
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionHeaderParser;

impl FilingParser for SubmissionHeaderParser {
    fn parse(&self, accession: &str, content: &[u8]) -> Result<ParsedFiling> {
        let text = String::from_utf8_lossy(content);
        let header = extract_header(&text)
            .ok_or_else(|| Error::Parse(format!("{}: no submission header", accession)))?;

        let mut parsed = ParsedFiling {
            accession_number: String::new(),
            form_type: String::new(),
            filed_date: None,
            period_of_report: None,
            document_count: None,
            filers: Vec::new(),
        };
        let mut role: Option<String> = None;
        let mut pending_name: Option<String> = None;

        for line in header.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let indented = line.starts_with(char::is_whitespace);
            let key = key.trim();
            let value = value.trim();

            if !indented && value.is_empty() {
                role = Some(key.to_string());
                continue;
            }

            match key {
                "ACCESSION NUMBER" => parsed.accession_number = value.to_string(),
                "CONFORMED SUBMISSION TYPE" => parsed.form_type = value.to_string(),
                "PUBLIC DOCUMENT COUNT" => parsed.document_count = value.parse().ok(),
                "FILED AS OF DATE" => parsed.filed_date = parse_index_date(value).ok(),
                "CONFORMED PERIOD OF REPORT" => {
                    parsed.period_of_report = parse_index_date(value).ok()
                }
                "COMPANY CONFORMED NAME" => pending_name = Some(value.to_string()),
                "CENTRAL INDEX KEY" => {
                    if let Some(name) = pending_name.take() {
                        parsed.filers.push(Filer {
                            role: role.clone(),
                            name,
                            entity_id: normalize_entity_id(value),
                        });
                    }
                }
                _ => {}
            }
        }

        if parsed.accession_number.is_empty() {
            return Err(Error::Parse(format!(
                "{}: header has no accession number",
                accession
            )));
        }
        if parsed.accession_number != accession {
            return Err(Error::Parse(format!(
                "Expected accession {}, document declares {}",
                accession, parsed.accession_number
            )));
        }
        if parsed.form_type.is_empty() {
            return Err(Error::Parse(format!(
                "{}: header has no submission type",
                accession
            )));
        }

        Ok(parsed)
    }
}

fn extract_header(text: &str) -> Option<&str> {
    let start = text.find("<SEC-HEADER>")?;
    let body_start = text[start..].find('\n')? + start + 1;
    let end = text[body_start..].find("</SEC-HEADER>")? + body_start;
    Some(&text[body_start..end])
}

fn normalize_entity_id(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
