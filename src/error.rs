use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised inside the asset delivery pipeline.
///
/// Only [`MirrorError::Cancelled`] ever crosses the consumer-facing surface of
/// [`AssetCache`](crate::cache::AssetCache); every other variant is converted
/// into a "no result" outcome at the layer where it happens.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid resource path: {0}")]
    InvalidPath(String),

    #[error("No endpoints configured")]
    NoEndpoints,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("Empty response body from {0}")]
    EmptyBody(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),
}

impl MirrorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MirrorError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
