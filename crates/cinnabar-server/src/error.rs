//! Server error types.

use thiserror::Error;

use cinnabar_store::StoreError;
use cinnabar_wire::WireError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed after exhausting retries.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// The leader address did not resolve.
    #[error("cannot resolve leader address {0:?}")]
    ResolveLeader(String),
}
