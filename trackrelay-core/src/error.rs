//! Error types for trackrelay-core

use thiserror::Error;

/// Main error type for the trackrelay-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Queue database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request could not be sent or no response arrived
    #[error("network error: {0}")]
    Network(String),

    /// Endpoint answered with a non-success status
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// Durable queue failed to open or is otherwise unusable
    #[error("queue store unavailable: {0}")]
    StoreUnavailable(String),

    /// Inbound message missing required fields
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl Error {
    /// True for failures a later resend may fix (network errors and HTTP statuses).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Http { .. })
    }
}

/// Result type alias for trackrelay-core
pub type Result<T> = std::result::Result<T, Error>;
