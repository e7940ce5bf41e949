//! Wire protocol error types.

use thiserror::Error;

/// Result type for codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised by the frame codec.
///
/// Every variant is connection-fatal: the byte stream can no longer be
/// framed and the offending connection must be closed. Recoverable
/// conditions ("need more input") are expressed as `Ok(None)` from the
/// decoder, not as errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame began with a byte that is not one of `+ - : $ *`.
    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownType(u8),

    /// A bare CRLF where a frame header was expected.
    #[error("empty frame line")]
    EmptyLine,

    /// An integer frame whose body does not parse as a signed 64-bit value.
    #[error("malformed integer frame: {0:?}")]
    MalformedInteger(String),

    /// A `$`/`*` header whose length is not a signed 64-bit value, or is
    /// negative and not the null sentinel `-1`.
    #[error("malformed length header: {0:?}")]
    MalformedLength(String),

    /// A bulk string whose payload was not followed by CRLF.
    #[error("bulk string payload not terminated by CRLF")]
    UnterminatedBulk,
}

/// Errors raised while interpreting a decoded frame as a command.
///
/// Unlike [`WireError`], these are recoverable: the reply is a simple error
/// frame and the connection stays up.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The frame was not an array of bulk strings.
    #[error("ERR expected an array of bulk strings")]
    NotAnArray,

    /// The verb is not one this server implements.
    #[error("ERR unknown command {0:?}")]
    UnknownCommand(String),

    /// The verb is known but the arguments are unusable.
    #[error("ERR {0}")]
    Parse(String),
}

impl CommandError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }
}
