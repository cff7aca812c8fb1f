//! Error taxonomy for the sync engine.
//!
//! Transient errors are retried with backoff inside the sync manager and
//! validation and permanent errors are collected per record. Storage errors
//! and requests the server refuses outright abort the current run.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed payload, rejected by the server before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connectivity failure, timeout, 5xx or backpressure response.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Retry budget exhausted, or a rejection that is not retry-eligible.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The server refused the request itself (credentials, unknown route),
    /// so no record in it was judged.
    #[error("request refused by sync server: {0}")]
    Refused(String),

    /// Local persistence failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the failed record should be rescheduled with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Whether the error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Refused(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("json: {err}"))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
