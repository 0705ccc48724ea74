//! Filing kind descriptors

use super::parser::{FilingParser, SubmissionHeaderParser};
use crate::archive::{ArchiveClient, MasterIndexEntry};
use crate::error::{Error, Result};
use std::sync::Arc;

/// What the downloader needs to know about one family of form types
pub trait FilingKind: Send + Sync {
    /// Stable name used in configuration and the `filings.kind` column
    fn tag(&self) -> &str;

    /// Form types handled by this kind, amendments included
    fn form_types(&self) -> &[&str];

    /// Parser handed the downloaded document
    fn parser(&self) -> &dyn FilingParser;

    fn accepts(&self, form_type: &str) -> bool {
        let form_type = form_type.trim();
        self.form_types()
            .iter()
            .any(|f| f.eq_ignore_ascii_case(form_type))
    }

    /// Where the full submission for an index entry lives
    fn document_url(&self, client: &ArchiveClient, entry: &MasterIndexEntry) -> String {
        client.archive_url(&entry.document_link)
    }
}

/// Built-in kind backed by the submission header parser
#[derive(Debug, Clone, Copy)]
pub struct StandardKind {
    tag: &'static str,
    form_types: &'static [&'static str],
    parser: SubmissionHeaderParser,
}

impl StandardKind {
    pub const fn new(tag: &'static str, form_types: &'static [&'static str]) -> Self {
        Self {
            tag,
            form_types,
            parser: SubmissionHeaderParser,
        }
    }
}

impl FilingKind for StandardKind {
    fn tag(&self) -> &str {
        self.tag
    }

    fn form_types(&self) -> &[&str] {
        self.form_types
    }

    fn parser(&self) -> &dyn FilingParser {
        &self.parser
    }
}

static BUILTIN_KINDS: [StandardKind; 6] = [
    StandardKind::new("ownership", &["3", "3/A", "4", "4/A", "5", "5/A"]),
    StandardKind::new(
        "beneficial-ownership",
        &["SC 13D", "SC 13D/A", "SC 13G", "SC 13G/A"],
    ),
    StandardKind::new("current-report", &["8-K", "8-K/A"]),
    StandardKind::new("periodic-report", &["10-K", "10-K/A", "10-Q", "10-Q/A"]),
    StandardKind::new("institutional-holdings", &["13F-HR", "13F-HR/A"]),
    StandardKind::new("exempt-offering", &["D", "D/A"]),
];

/// Tags accepted in `[download].kinds`
pub const BUILTIN_KIND_TAGS: [&str; 6] = [
    "ownership",
    "beneficial-ownership",
    "current-report",
    "periodic-report",
    "institutional-holdings",
    "exempt-offering",
];

/// Look up a built-in kind
pub fn kind_by_tag(tag: &str) -> Result<Arc<dyn FilingKind>> {
    BUILTIN_KINDS
        .iter()
        .find(|k| k.tag == tag)
        .map(|k| Arc::new(*k) as Arc<dyn FilingKind>)
        .ok_or_else(|| Error::UnknownKind(tag.to_string()))
}

/// First built-in kind accepting a form type
pub fn route_builtin(form_type: &str) -> Option<Arc<dyn FilingKind>> {
    BUILTIN_KINDS
        .iter()
        .find(|k| k.accepts(form_type))
        .map(|k| Arc::new(*k) as Arc<dyn FilingKind>)
}

/// The non-empty set of kinds one downloader serves
#[derive(Clone)]
pub struct KindSet {
    kinds: Vec<Arc<dyn FilingKind>>,
}

impl KindSet {
    pub fn new(kinds: Vec<Arc<dyn FilingKind>>) -> Result<Self> {
        if kinds.is_empty() {
            return Err(Error::Validation(
                "At least one filing kind is required".to_string(),
            ));
        }
        Ok(Self { kinds })
    }

    /// Resolve configured tags, rejecting unknown ones
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Result<Self> {
        let kinds = tags
            .iter()
            .map(|t| kind_by_tag(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(kinds)
    }

    /// Kind responsible for a form type, if any
    pub fn route(&self, form_type: &str) -> Option<&Arc<dyn FilingKind>> {
        self.kinds.iter().find(|k| k.accepts(form_type))
    }

    /// Every form type across the set
    pub fn form_types(&self) -> Vec<String> {
        self.kinds
            .iter()
            .flat_map(|k| k.form_types().iter().map(|f| f.to_string()))
            .collect()
    }

    /// Form types with their own entry in the latest-filings feed
    pub fn base_form_types(&self) -> Vec<String> {
        self.kinds
            .iter()
            .flat_map(|k| k.form_types().iter())
            .filter(|f| !f.ends_with("/A"))
            .map(|f| f.to_string())
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.kinds.iter().map(|k| k.tag().to_string()).collect()
    }
}

impl std::fmt::Debug for KindSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KindSet").field(&self.tags()).finish()
    }
}
