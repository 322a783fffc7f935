//! Error types for dequeue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Backend failure. The store applied no partial mutation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("queue item not found: {0}")]
    NotFound(String),

    /// Rejected before any storage call.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
