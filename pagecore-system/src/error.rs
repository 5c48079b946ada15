//! Error types for the pagecore-system crate
//!
//! Every variant here is a startup-time failure: the server refuses to
//! start rather than running with a half-understood configuration.

use thiserror::Error;

/// Result type for pagecore-system operations
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration and wiring errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be read
    #[error("Cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON for [`SystemConfig`]
    ///
    /// [`SystemConfig`]: crate::config::SystemConfig
    #[error("Cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An external server spec string is malformed
    #[error("Invalid server spec {spec:?}: {reason}")]
    InvalidServerSpec { spec: String, reason: String },

    /// A fetcher option failed validation
    #[error(transparent)]
    Fetch(#[from] pagecore_fetch::Error),

    /// A required option is absent
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),
}
