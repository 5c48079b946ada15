//! Error types for the pagecore-fetch crate

use thiserror::Error;

/// Result type for pagecore-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for fetch configuration and setup
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// An https_options directive contained an unknown token
    #[error("Invalid HTTPS option: {0}")]
    InvalidHttpsOption(String),

    /// A proxy specification was rejected
    #[error("Invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
}
