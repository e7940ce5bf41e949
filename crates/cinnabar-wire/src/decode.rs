//! Streaming frame decoder.
//!
//! Decoding runs in two stages over the connection's inbound buffer: a line
//! scanner that yields CRLF-terminated lines (and raw payload slices for
//! bulk bodies, which may themselves contain CRLF), and a frame assembler
//! on top. The assembler works through a [`Cursor`] that only records how
//! far it has read; the buffer is consumed solely when a whole frame came
//! out, so an incomplete tail is rewound intact for the next read cycle.

use bytes::{Buf, BytesMut};

use crate::error::{WireError, WireResult};
use crate::frame::Frame;

/// How the decoder should frame the next `$` header.
///
/// During a full resync the leader ships the snapshot as a bulk payload
/// with no trailing CRLF; the consumer advertises that expectation here.
/// The discipline applies to the outermost frame only — elements nested in
/// arrays always use normal framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDiscipline {
    #[default]
    Normal,
    SnapshotPayload,
}

/// A decoded frame together with the number of wire bytes it occupied.
///
/// The byte count feeds the replication offset on followers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: Frame,
    pub wire_len: usize,
}

/// Read-only view over the undecoded buffer with a consumption mark.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// The next CRLF-terminated line, without its terminator.
    ///
    /// Returns `None` when no full line is buffered yet.
    fn line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.bytes[self.pos..];
        let nl = rest.windows(2).position(|w| w == b"\r\n")?;
        self.pos += nl + 2;
        Some(&rest[..nl])
    }

    /// Exactly `n` raw bytes, or `None` if fewer are buffered.
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let rest = &self.bytes[self.pos..];
        if rest.len() < n {
            return None;
        }
        self.pos += n;
        Some(&rest[..n])
    }
}

impl Frame {
    /// Extracts one frame from the front of `buf`.
    ///
    /// - `Ok(Some(_))` — a whole frame was decoded and its bytes consumed.
    /// - `Ok(None)` — `buf` holds an incomplete frame; nothing consumed.
    /// - `Err(_)` — the bytes are malformed; the connection is beyond
    ///   saving and must be closed.
    pub fn decode(
        buf: &mut BytesMut,
        discipline: FrameDiscipline,
    ) -> WireResult<Option<DecodedFrame>> {
        let mut cursor = Cursor::new(&buf[..]);
        let snapshot = discipline == FrameDiscipline::SnapshotPayload;
        match parse_frame(&mut cursor, snapshot)? {
            Some(frame) => {
                let wire_len = cursor.pos;
                buf.advance(wire_len);
                Ok(Some(DecodedFrame { frame, wire_len }))
            }
            None => Ok(None),
        }
    }
}

fn parse_frame(cursor: &mut Cursor<'_>, snapshot: bool) -> WireResult<Option<Frame>> {
    let Some(line) = cursor.line() else {
        return Ok(None);
    };
    let Some((&lead, body)) = line.split_first() else {
        return Err(WireError::EmptyLine);
    };
    let body_text = || String::from_utf8_lossy(body).into_owned();

    match lead {
        b'+' => Ok(Some(Frame::SimpleString(body_text()))),
        b'-' => Ok(Some(Frame::SimpleError(body_text()))),
        b':' => match parse_i64(body) {
            Some(n) => Ok(Some(Frame::Integer(n))),
            None => Err(WireError::MalformedInteger(body_text())),
        },
        b'$' => {
            let Some(len) = parse_len(body, &body_text)? else {
                return Ok(Some(Frame::BulkString(None)));
            };
            let Some(payload) = cursor.take(len) else {
                return Ok(None);
            };
            let payload = bytes::Bytes::copy_from_slice(payload);
            if snapshot {
                // Snapshot transfer: no terminator follows the payload.
                return Ok(Some(Frame::BulkPayload(payload)));
            }
            let Some(terminator) = cursor.take(2) else {
                return Ok(None);
            };
            if terminator != b"\r\n" {
                return Err(WireError::UnterminatedBulk);
            }
            Ok(Some(Frame::BulkString(Some(payload))))
        }
        b'*' => {
            let Some(len) = parse_len(body, &body_text)? else {
                return Ok(Some(Frame::Array(None)));
            };
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                match parse_frame(cursor, false)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            Ok(Some(Frame::Array(Some(items))))
        }
        other => Err(WireError::UnknownType(other)),
    }
}

fn parse_i64(body: &[u8]) -> Option<i64> {
    std::str::from_utf8(body).ok()?.parse().ok()
}

/// Parses a `$`/`*` length header. `None` means the null sentinel `-1`.
fn parse_len(body: &[u8], body_text: &dyn Fn() -> String) -> WireResult<Option<usize>> {
    match parse_i64(body) {
        Some(-1) => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as usize)),
        _ => Err(WireError::MalformedLength(body_text())),
    }
}
