//! Error types shared by the dispatcher and the historical query engine.

use thiserror::Error;

/// A time expression that is neither a relative duration nor a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time expression '{0}'")]
pub struct TimeParseError(pub String);

/// Failures surfaced by a message source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Any broker error other than "no message" or "end of partition".
    #[error("broker error: {0}")]
    Broker(String),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message source is closed")]
    Closed,
}

impl SourceError {
    /// Whether the drain loop must give up after seeing this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Broker(_) | SourceError::Closed)
    }
}

/// Failures talking to the time-series store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl From<csv::Error> for StoreError {
    fn from(e: csv::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

/// Failures of a historical query.
///
/// An empty result is not an error; callers decide how to report "no data".
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TimeParseError> for QueryError {
    fn from(e: TimeParseError) -> Self {
        QueryError::InvalidInput(e.to_string())
    }
}
