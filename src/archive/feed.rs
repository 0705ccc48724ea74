//! Latest-filings Atom feed parsing
//!
//! The feed is small and regular, so entries are pulled apart with plain
//! string scanning rather than a full XML parser.

use super::index::{accession_from_link, is_valid_accession, MasterIndexEntry};
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::debug;

/// Parse feed entries into index entries, first occurrence of each
/// accession number wins
pub fn parse_atom_feed(content: &str) -> Vec<MasterIndexEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for block in content.split("<entry>").skip(1) {
        let block = match block.find("</entry>") {
            Some(end) => &block[..end],
            None => block,
        };

        match parse_entry(block) {
            Some((accession, entry)) => {
                if seen.insert(accession) {
                    entries.push(entry);
                }
            }
            None => debug!("Skipping unparseable feed entry"),
        }
    }

    entries
}

fn parse_entry(block: &str) -> Option<(String, MasterIndexEntry)> {
    let title = decode_entities(&extract_tag(block, "title")?);
    let link = extract_attr(block, "link", "href");

    let accession = extract_tag(block, "id")
        .and_then(|id| id.split("accession-number=").nth(1).map(str::to_string))
        .filter(|a| is_valid_accession(a))
        .or_else(|| link.as_deref().and_then(accession_from_link))?;

    let form_type = extract_attr(block, "category", "term")
        .or_else(|| title.split(" - ").next().map(str::to_string))?
        .trim()
        .to_string();

    let (entity_name, entity_id) = split_title(&title)?;

    let date_filed = extract_tag(block, "updated")
        .and_then(|u| NaiveDate::parse_from_str(u.get(..10)?, "%Y-%m-%d").ok())?;

    let entry = MasterIndexEntry {
        document_link: format!("edgar/data/{}/{}.txt", entity_id, accession),
        entity_id,
        entity_name,
        form_type,
        date_filed,
    };
    Some((accession, entry))
}

/// `4 - Doe John (0001234567) (Reporting)` -> ("Doe John", "1234567")
fn split_title(title: &str) -> Option<(String, String)> {
    let after_form = title.split_once(" - ").map(|(_, rest)| rest)?;

    let mut name_end = None;
    let mut id = None;
    for (open, _) in after_form.match_indices('(') {
        let close = after_form[open..].find(')')? + open;
        let inner = &after_form[open + 1..close];
        if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
            name_end = Some(open);
            id = Some(inner);
            break;
        }
    }

    let name = after_form[..name_end?].trim().to_string();
    let trimmed = id?.trim_start_matches('0');
    let id = if trimmed.is_empty() { "0" } else { trimmed };
    Some((name, id.to_string()))
}

/// Text content of the first `<tag>...</tag>`
fn extract_tag(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let start = block.find(&open)?;
    let content_start = block[start..].find('>')? + start + 1;
    let end = block[content_start..].find(&close)? + content_start;
    Some(block[content_start..end].trim().to_string())
}

/// Attribute value of the first `<tag ... attr="...">`
fn extract_attr(block: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{} ", tag);
    let start = block.find(&open)?;
    let tag_end = block[start..].find('>')? + start;
    let element = &block[start..tag_end];

    let needle = format!("{}=\"", attr);
    let value_start = element.find(&needle)? + needle.len();
    let value_end = element[value_start..].find('"')? + value_start;
    Some(decode_entities(&element[value_start..value_end]))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="ISO-8859-1" ?>
<feed xmlns="http://www.w3.org/2005/Atom">
<title>Latest Filings</title>
<entry>
<title>4 - Doe John (0001234567) (Reporting)</title>
<link rel="alternate" type="text/html" href="https://archive.test/Archives/edgar/data/1234567/000095017024000001/0000950170-24-000001-index.htm"/>
<summary type="html"> &lt;b&gt;Filed:&lt;/b&gt; 2024-01-02 </summary>
<updated>2024-01-02T16:05:01-05:00</updated>
<category scheme="https://archive.test/" label="form type" term="4"/>
<id>urn:tag:sec.gov,2008:accession-number=0000950170-24-000001</id>
</entry>
<entry>
<title>4 - Smith &amp; Sons Inc (0000007654) (Issuer)</title>
<link rel="alternate" type="text/html" href="https://archive.test/Archives/edgar/data/7654/000095017024000001/0000950170-24-000001-index.htm"/>
<updated>2024-01-02T16:05:01-05:00</updated>
<category scheme="https://archive.test/" label="form type" term="4"/>
<id>urn:tag:sec.gov,2008:accession-number=0000950170-24-000001</id>
</entry>
<entry>
<title>SC 13G/A - Big Fund (Holdings) LP (0000999999) (Filed by)</title>
<link rel="alternate" type="text/html" href="https://archive.test/Archives/edgar/data/999999/000099999924000007/0000999999-24-000007-index.htm"/>
<updated>2024-01-03T09:00:00-05:00</updated>
<category scheme="https://archive.test/" label="form type" term="SC 13G/A"/>
<id>urn:tag:sec.gov,2008:accession-number=0000999999-24-000007</id>
</entry>
</feed>"#;

    #[test]
    fn test_parse_feed_dedups_accessions() {
        let entries = parse_atom_feed(FEED);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].form_type, "4");
        assert_eq!(entries[0].entity_id, "1234567");
        assert_eq!(entries[0].entity_name, "Doe John");
        assert_eq!(
            entries[0].document_link,
            "edgar/data/1234567/0000950170-24-000001.txt"
        );
        assert_eq!(
            entries[0].accession_number().as_deref(),
            Some("0000950170-24-000001")
        );

        assert_eq!(entries[1].form_type, "SC 13G/A");
        assert_eq!(entries[1].entity_name, "Big Fund (Holdings) LP");
        assert_eq!(
            entries[1].date_filed,
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()
        );
    }

    #[test]
    fn test_split_title() {
        assert_eq!(
            split_title("8-K - ACME CORP (0000000042) (Filer)"),
            Some(("ACME CORP".to_string(), "42".to_string()))
        );
        assert_eq!(split_title("no separator"), None);
    }

    #[test]
    fn test_empty_feed() {
        assert!(parse_atom_feed("<feed></feed>").is_empty());
    }
}
