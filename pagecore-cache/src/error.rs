//! Error types for the pagecore-cache crate

use thiserror::Error;

/// Result type for pagecore-cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Base primitive error
    #[error("Base error: {0}")]
    Base(#[from] pagecore_base::Error),

    /// An HTTP value buffer failed structural validation
    #[error("Malformed HTTP value: {0}")]
    MalformedValue(String),

    /// Headers were installed twice on the same HTTP value
    #[error("Headers already set on HTTP value")]
    HeadersAlreadySet,

    /// A region grew past the 32-bit length prefix
    #[error("HTTP value region exceeds 4 GiB limit")]
    RegionTooLarge,

    /// A cohort write was attempted on a page never read
    #[error("Cohort {0} written without a prior page read")]
    PageNotRead(String),

    /// A cohort name was not registered with the property cache
    #[error("Unknown cohort: {0}")]
    UnknownCohort(String),

    /// A compressed payload failed to decompress
    #[error("Corrupt compressed payload: {0}")]
    CorruptPayload(String),
}
