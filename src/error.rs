// Error types for the eGarden core.
// Covers image fetch errors, cache storage errors, and secret decryption failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EgardenError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fetching {uri} failed with HTTP {status}")]
    FetchStatus { uri: String, status: u16 },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EgardenError>;
