//! Error types for `Drover` core library.

use thiserror::Error;

/// Result type alias using `Drover` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Drover` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON line parsed as JSON but carried no usable discriminator
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
