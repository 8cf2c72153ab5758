//! Collector error taxonomy
//!
//! Each failure class maps to one recovery rule: connection failures end the
//! current cycle, malformed rows are skipped, persistence failures leave the
//! file pending for the next cycle, and bad exclusion patterns are dropped.

use thiserror::Error;

/// Result type alias for file-level collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Failure to open a session with the controller
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection to {addr} timed out")]
    Timeout { addr: String },

    #[error("Connection refused by {addr}")]
    Refused { addr: String },

    #[error("Login rejected for user '{user}': {reason}")]
    Authentication { user: String, reason: String },

    #[error("Unexpected connection failure: {0}")]
    Other(String),
}

/// A single CSV row that could not be normalized
#[derive(Error, Debug)]
pub enum PartialParseError {
    #[error("line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },

    #[error("line {line}: expected at least {expected} fields, found {found}")]
    TooFewFields { line: u64, expected: usize, found: usize },

    #[error("line {line}: row has no content")]
    Empty { line: u64 },
}

/// Failure to write or read persisted rows
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Insert of {rows} rows for '{file}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        file: String,
        rows: usize,
        attempts: u32,
        last: Box<PersistenceError>,
    },

    #[error("Only {landed} of {expected} rows landed for '{file}'")]
    Shortfall {
        file: String,
        expected: i64,
        landed: i64,
    },
}

/// Invalid configuration input
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid exclusion pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Umbrella error for one file's trip through the pipeline
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Transfer of '{target}' failed: {reason}")]
    Transfer { target: String, reason: String },

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] ihm_common::IhmError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CollectorError {
    pub fn transfer(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CollectorError::Transfer {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}
