//! Error types for the pagecore-base crate

use thiserror::Error;

/// Result type for pagecore-base operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for base primitives
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A shared-memory segment could not be created
    #[error("Could not create shared segment {name}: {reason}")]
    SegmentCreate { name: String, reason: String },

    /// A shared-memory segment could not be attached
    #[error("Could not attach shared segment {name}: {reason}")]
    SegmentAttach { name: String, reason: String },

    /// The shared-memory runtime does not provide segments at all
    #[error("Shared memory is not available on this runtime")]
    SharedMemUnavailable,

    /// A lock operation failed for a reason other than contention
    #[error("Lock {name} failed: {source}")]
    LockFailed {
        name: String,
        source: std::io::Error,
    },

    /// A buffer write ran past the addressable range
    #[error("Buffer write at offset {offset} exceeds length {len}")]
    BufferRange { offset: usize, len: usize },
}
