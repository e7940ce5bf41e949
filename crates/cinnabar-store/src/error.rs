//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by storage operations.
///
/// The `Display` text of the command-level variants is the canonical wire
/// message; [`StoreError::code`] supplies the error-class prefix.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write addressed a key holding a value of a different kind.
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    /// An explicit `0-0` entry ID on append.
    #[error("The ID specified in XADD must be greater than 0-0")]
    ZeroStreamId,

    /// An appended ID not strictly greater than the stream's top entry.
    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    NonMonotonicStreamId,

    /// The snapshot file holds a construct outside the supported subset.
    #[error("unsupported snapshot content: {0}")]
    Snapshot(String),

    /// I/O failure while reading the snapshot file.
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The error-class token prefixed to the wire message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WrongType => "WRONGTYPE",
            _ => "ERR",
        }
    }
}
