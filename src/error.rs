//! Error taxonomy for a sync run.
//!
//! Run-scoped failures (`AuthError`, a page-level `PageFetchError`, a storage
//! connection failure) surface as [`SyncError`]. Record-scoped failures
//! (`FetchError` on a sub-resource, `MappingError`, `WriteError`) are logged,
//! counted in the run summary and never abort the run.

use crate::sync::RawRecord;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Credential acquisition failed. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("auth service returned status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("failed to decode auth response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("auth response did not include an access token")]
    MissingToken,
}

/// A single page or sub-resource request failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("{url} returned status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] AuthError),
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} was cancelled")]
    Cancelled { url: String },
    #[error("{url} was already requested in this run")]
    AlreadyFetched { url: String },
}

impl FetchError {
    pub fn status(url: impl Into<String>, status: StatusCode, body: String) -> Self {
        FetchError::Status {
            url: url.into(),
            status,
            body,
        }
    }
}

/// Pagination stopped early. Carries every record fetched before the failure.
#[derive(Debug, Error)]
#[error("pagination stopped after {pages_fetched} pages ({} records kept): {source}", .partial.len())]
pub struct PageFetchError {
    pub pages_fetched: usize,
    pub partial: Vec<RawRecord>,
    #[source]
    pub source: FetchError,
}

/// Diagnostics raised while projecting a flat record onto a table mapping.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping '{mapping}' declares no primary key; skipped")]
    MissingPrimaryKey { mapping: String },
    #[error("mapping '{mapping}' column '{column}': path '{path}' resolved to a container")]
    ContainerCoerced {
        mapping: String,
        column: String,
        path: String,
    },
    #[error("mapping '{mapping}' column '{column}': failed to encode value: {source}")]
    Encode {
        mapping: String,
        column: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid configuration detected before the run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
    #[error("failed to read mapping file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse mapping file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid path template '{template}': {reason}")]
    InvalidPath { template: String, reason: String },
    #[error("'{0}' is not a plain SQL identifier")]
    InvalidIdentifier(String),
    #[error("mapping '{mapping}': primary key '{column}' is not one of its columns")]
    UnknownPrimaryKey { mapping: String, column: String },
    #[error("mapping '{mapping}': primary key path must use the row index when other columns do")]
    UnindexedPrimaryKey { mapping: String },
    #[error("mapping '{mapping}' targets table '{table}' which is missing from the write plan")]
    TableNotPlanned { mapping: String, table: String },
    #[error("table '{0}' appears more than once in the write plan")]
    DuplicatePlanEntry(String),
}

/// A storage operation failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("foreign key violation: {table}.{column} = {value} has no row in {references}")]
    ForeignKey {
        table: String,
        column: String,
        value: String,
        references: String,
    },
    #[error("transaction already finished")]
    TransactionClosed,
}

/// A row write failed; the whole record was rolled back.
#[derive(Debug, Error)]
#[error("record {record_id}: write to {table} failed: {source}")]
pub struct WriteError {
    pub record_id: String,
    pub table: String,
    #[source]
    pub source: StorageError,
}

/// Failures that abort the run (or, for `Fetch`, the current pagination chain).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("page fetch failed: {0}")]
    Fetch(#[from] PageFetchError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("storage unavailable: {0}")]
    FatalStorage(StorageError),
    #[error("failed to write snapshot: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("run cancelled")]
    Cancelled,
}

pub type SyncResult<T> = Result<T, SyncError>;
