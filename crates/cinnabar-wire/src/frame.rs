//! The RESP frame model and encoder.

use bytes::{BufMut, Bytes, BytesMut};

/// A single protocol message.
///
/// `BulkString(None)` and `Array(None)` are the null forms (`$-1`, `*-1`).
/// `BulkPayload` is the headered-but-unterminated blob used for snapshot
/// transfer. `Leave` is an internal sentinel instructing the connection
/// handler to drain pending output and close; it never crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SimpleString(String),
    SimpleError(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    BulkPayload(Bytes),
    Array(Option<Vec<Frame>>),
    Leave,
}

impl Frame {
    /// A simple string frame.
    pub fn simple(text: impl Into<String>) -> Self {
        Self::SimpleString(text.into())
    }

    /// A simple error frame.
    pub fn error(text: impl Into<String>) -> Self {
        Self::SimpleError(text.into())
    }

    /// A non-null bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::BulkString(Some(data.into()))
    }

    /// A bulk string frame holding UTF-8 text.
    pub fn bulk_text(text: impl Into<String>) -> Self {
        Self::BulkString(Some(Bytes::from(text.into())))
    }

    /// The null bulk string, `$-1`.
    pub fn null_bulk() -> Self {
        Self::BulkString(None)
    }

    /// A non-null array frame.
    pub fn array(items: Vec<Frame>) -> Self {
        Self::Array(Some(items))
    }

    /// The null array, `*-1`.
    pub fn null_array() -> Self {
        Self::Array(None)
    }

    /// Serializes the frame onto `buf`.
    ///
    /// `BulkPayload` writes its header and bytes with no trailing CRLF;
    /// `Leave` writes nothing.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::SimpleString(text) => {
                buf.put_u8(b'+');
                buf.put_slice(text.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::SimpleError(text) => {
                buf.put_u8(b'-');
                buf.put_slice(text.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::BulkString(None) => buf.put_slice(b"$-1\r\n"),
            Self::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Self::BulkPayload(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
            }
            Self::Array(None) => buf.put_slice(b"*-1\r\n"),
            Self::Array(Some(items)) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
            Self::Leave => {}
        }
    }

    /// Serializes the frame into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// The exact number of bytes [`Frame::encode`] would write.
    ///
    /// Replication offsets are byte counts of propagated frames, so this
    /// must stay in lockstep with the encoder.
    pub fn wire_len(&self) -> usize {
        fn decimal_width(n: i64) -> usize {
            // Sign plus digits; avoids a heap format just to measure.
            let neg = usize::from(n < 0);
            let mut n = n.unsigned_abs();
            let mut width = 1;
            while n >= 10 {
                n /= 10;
                width += 1;
            }
            neg + width
        }

        match self {
            Self::SimpleString(text) | Self::SimpleError(text) => 1 + text.len() + 2,
            Self::Integer(n) => 1 + decimal_width(*n) + 2,
            Self::BulkString(None) | Self::Array(None) => 5,
            Self::BulkString(Some(data)) => {
                1 + decimal_width(data.len() as i64) + 2 + data.len() + 2
            }
            Self::BulkPayload(data) => 1 + decimal_width(data.len() as i64) + 2 + data.len(),
            Self::Array(Some(items)) => {
                let header = 1 + decimal_width(items.len() as i64) + 2;
                header + items.iter().map(Frame::wire_len).sum::<usize>()
            }
            Self::Leave => 0,
        }
    }

    /// The bulk-string payload, if this frame is a non-null bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Self::BulkString(Some(data)) => Some(data),
            _ => None,
        }
    }
}
