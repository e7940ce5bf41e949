//! # cinnabar-wire: Wire protocol for Cinnabar
//!
//! This crate defines the RESP-family frame model ([`Frame`]), the streaming
//! decoder with its incomplete-vs-malformed contract, and the typed command
//! model ([`Command`]) parsed from and re-encoded to frames.
//!
//! ## Framing
//!
//! Frames are the standard RESP kinds (`+` simple string, `-` simple error,
//! `:` integer, `$` bulk string, `*` array) with one deviation: the snapshot
//! transferred during a full resync is a *bulk payload* — a `$<n>\r\n`
//! header followed by exactly `n` bytes and **no** trailing CRLF. The
//! decoder must be told when to expect that form via [`FrameDiscipline`].
//!
//! ## Decoder contract
//!
//! [`Frame::decode`] distinguishes two failure modes, and the distinction is
//! part of the contract:
//! - *incomplete* — the buffer holds a strict prefix of a frame; returns
//!   `Ok(None)` and consumes nothing, so the caller retries after the next
//!   read;
//! - *malformed* — the bytes can never become a valid frame; returns a
//!   [`WireError`], which is fatal for the connection that produced it.

mod command;
mod decode;
mod error;
mod frame;

pub use command::Command;
pub use decode::{DecodedFrame, FrameDiscipline};
pub use error::{CommandError, WireError, WireResult};
pub use frame::Frame;
