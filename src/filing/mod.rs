//! Filing kinds, parsing, and the output sink
//!
//! This module provides:
//! - Descriptors for the families of form types the downloader serves
//! - The parser boundary plus a header parser shared by every kind
//! - The sink parsed filings are written to

mod kinds;
mod parser;

pub use kinds::*;
pub use parser::*;

use crate::error::Result;
use async_trait::async_trait;

/// Destination for parsed filings
#[async_trait]
pub trait FilingSink: Send + Sync {
    /// Store one parsed filing under its kind tag; repeated calls for the
    /// same accession number overwrite
    async fn persist(&self, kind: &str, filing: &ParsedFiling) -> Result<()>;
}

/// Minimal full-submission document for tests
#[cfg(test)]
pub(crate) fn sample_submission(accession: &str, form_type: &str) -> String {
    format!(
        "<SEC-DOCUMENT>{acc}.txt : 20240102\n\
         <SEC-HEADER>{acc}.hdr.sgml : 20240102\n\
         ACCESSION NUMBER:\t\t{acc}\n\
         CONFORMED SUBMISSION TYPE:\t{form}\n\
         PUBLIC DOCUMENT COUNT:\t\t1\n\
         CONFORMED PERIOD OF REPORT:\t20231229\n\
         FILED AS OF DATE:\t\t20240102\n\
         \n\
         REPORTING-OWNER:\n\
         \n\
         \tOWNER DATA:\n\
         \t\tCOMPANY CONFORMED NAME:\t\t\tDoe John\n\
         \t\tCENTRAL INDEX KEY:\t\t\t0001234567\n\
         \n\
         ISSUER:\n\
         \n\
         \tCOMPANY DATA:\n\
         \t\tCOMPANY CONFORMED NAME:\t\t\tACME CORP\n\
         \t\tCENTRAL INDEX KEY:\t\t\t0000000042\n\
         </SEC-HEADER>\n\
         <DOCUMENT>\n<TYPE>{form}\n</DOCUMENT>\n\
         </SEC-DOCUMENT>\n",
        acc = accession,
        form = form_type
    )
}
