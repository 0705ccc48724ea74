//! Custom error types for filingsync

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for filingsync operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Archive blocked the request: {url}")]
    Blocked { url: String },

    #[error("HTTP {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Illegal status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown filing kind: {0}")]
    UnknownKind(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a per-filing failure, persisted on the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Network,
    Blocked,
    Parse,
    Store,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::Blocked => write!(f, "blocked"),
            FailureKind::Parse => write!(f, "parse"),
            FailureKind::Store => write!(f, "store"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network" => Ok(FailureKind::Network),
            "blocked" => Ok(FailureKind::Blocked),
            "parse" => Ok(FailureKind::Parse),
            "store" => Ok(FailureKind::Store),
            "cancelled" => Ok(FailureKind::Cancelled),
            _ => Err(Error::Other(format!("Unknown failure kind: {}", s))),
        }
    }
}

impl Error {
    /// Classify this error as it should be recorded on a failed filing
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Blocked { .. } => FailureKind::Blocked,
            Error::Http(_) | Error::HttpStatus { .. } | Error::NotAvailable(_) => {
                FailureKind::Network
            }
            Error::Parse(_) | Error::Json(_) => FailureKind::Parse,
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Store,
        }
    }

    /// Errors that are rejected locally and never worth retrying
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Config(_))
    }
}

/// Result type alias for filingsync
pub type Result<T> = std::result::Result<T, Error>;
