//! Error taxonomy for the OAI index core.
//!
//! Read-side errors (`UnknownPrefix`, `NoRecordsMatch`) are ordinary
//! control flow surfaced to the protocol layer as OAI-PMH conditions;
//! they are expected on most queries and must not be logged as errors.
//! `StampOrdering` signals a rolled-back write.

use crate::stamp::Stamp;
use crate::store::StorageError;

#[derive(Debug)]
pub enum OaiError {
    /// Malformed caller input (empty identifier, empty prefix list, ...)
    InvalidArgument(String),
    /// Selection against a prefix that was never registered
    UnknownPrefix(String),
    /// Selection produced an empty result
    NoRecordsMatch,
    /// Resumption token does not decode to the expected field set
    BadResumptionToken(String),
    /// A write tried to index a non-increasing stamp; the operation was rolled back
    StampOrdering { stamp: Stamp, newest: Stamp },
    /// Persistence backend failure
    Storage(StorageError),
}

impl std::fmt::Display for OaiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OaiError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            OaiError::UnknownPrefix(prefix) => write!(f, "unknown metadata prefix: {}", prefix),
            OaiError::NoRecordsMatch => write!(f, "no records match the given criteria"),
            OaiError::BadResumptionToken(token) => write!(f, "bad resumption token: {}", token),
            OaiError::StampOrdering { stamp, newest } => {
                write!(
                    f,
                    "stamp ordering violation: {} is not greater than newest stamp {}",
                    stamp, newest
                )
            }
            OaiError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for OaiError {}

impl From<StorageError> for OaiError {
    fn from(e: StorageError) -> Self {
        OaiError::Storage(e)
    }
}
