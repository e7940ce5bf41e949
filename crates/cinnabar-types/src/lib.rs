//! # cinnabar-types: Core types for Cinnabar
//!
//! This crate contains shared types used across the Cinnabar system:
//! - Stream entry identifiers ([`StreamId`]) and their parse-time variants
//!   ([`InputStreamId`], [`BoundStreamId`], [`ReadStreamId`])
//! - Registry handles ([`ReplicaId`], [`WaitId`], [`StreamWaiterId`])
//!
//! Stream entry IDs are `(ms, seq)` pairs ordered lexicographically. The
//! parse-time variants exist because the wire accepts wildcard forms that
//! never reach storage: `*` and `ms-*` on append, `-`/`+` on range bounds,
//! and `$` on reads.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

// ============================================================================
// Stream entry IDs
// ============================================================================

/// Identifier of a single stream entry: a millisecond timestamp plus a
/// sequence number disambiguating entries within the same millisecond.
///
/// Ordered lexicographically by `(ms, seq)`; the derive order of the fields
/// is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The smallest ID strictly greater than `self`, saturating at
    /// [`StreamId::MAX`].
    pub fn next(self) -> Self {
        if self.seq == u64::MAX {
            if self.ms == u64::MAX {
                Self::MAX
            } else {
                Self::new(self.ms + 1, 0)
            }
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Errors produced while parsing any of the stream ID forms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamIdParseError {
    #[error("stream id is empty")]
    Empty,
    #[error("invalid millisecond part in stream id {0:?}")]
    BadMs(String),
    #[error("invalid sequence part in stream id {0:?}")]
    BadSeq(String),
}

/// Splits `text` at the first `-` and parses both halves as `u64`.
///
/// A missing `-` is the bare-milliseconds shorthand: `"5"` parses as `5-0`.
fn parse_exact(text: &str) -> Result<StreamId, StreamIdParseError> {
    match text.split_once('-') {
        Some((ms, seq)) => {
            let ms = ms
                .parse::<u64>()
                .map_err(|_| StreamIdParseError::BadMs(text.to_owned()))?;
            let seq = seq
                .parse::<u64>()
                .map_err(|_| StreamIdParseError::BadSeq(text.to_owned()))?;
            Ok(StreamId::new(ms, seq))
        }
        None => {
            let ms = text
                .parse::<u64>()
                .map_err(|_| StreamIdParseError::BadMs(text.to_owned()))?;
            Ok(StreamId::new(ms, 0))
        }
    }
}

/// A stream ID as supplied to an append: exact, sequence-wildcard
/// (`"ms-*"`), or fully generated (`"*"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStreamId {
    Exact(StreamId),
    SeqWildcard { ms: u64 },
    Wildcard,
}

impl FromStr for InputStreamId {
    type Err = StreamIdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(StreamIdParseError::Empty);
        }
        if text == "*" {
            return Ok(Self::Wildcard);
        }
        if let Some(ms) = text.strip_suffix("-*") {
            let ms = ms
                .parse::<u64>()
                .map_err(|_| StreamIdParseError::BadMs(text.to_owned()))?;
            return Ok(Self::SeqWildcard { ms });
        }
        parse_exact(text).map(Self::Exact)
    }
}

impl Display for InputStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(id) => write!(f, "{id}"),
            Self::SeqWildcard { ms } => write!(f, "{ms}-*"),
            Self::Wildcard => write!(f, "*"),
        }
    }
}

/// A stream ID as supplied to a range bound: exact, or unbound (`"-"` on
/// the left edge, `"+"` on the right — the caller substitutes the extreme).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundStreamId {
    Exact(StreamId),
    Unbound,
}

impl BoundStreamId {
    /// Resolves the bound against the extreme it stands in for.
    pub fn resolve(self, unbound_as: StreamId) -> StreamId {
        match self {
            Self::Exact(id) => id,
            Self::Unbound => unbound_as,
        }
    }
}

impl FromStr for BoundStreamId {
    type Err = StreamIdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "" => Err(StreamIdParseError::Empty),
            "-" | "+" => Ok(Self::Unbound),
            _ => parse_exact(text).map(Self::Exact),
        }
    }
}

/// A stream ID as supplied to a read: exact, or `"$"` meaning "entries
/// strictly after the current top at registration time".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStreamId {
    Exact(StreamId),
    Latest,
}

impl FromStr for ReadStreamId {
    type Err = StreamIdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "" => Err(StreamIdParseError::Empty),
            "$" => Ok(Self::Latest),
            _ => parse_exact(text).map(Self::Exact),
        }
    }
}

impl Display for ReadStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(id) => write!(f, "{id}"),
            Self::Latest => write!(f, "$"),
        }
    }
}

// ============================================================================
// Registry handles - all Copy (cheap 8-byte values)
// ============================================================================

macro_rules! registry_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn new(id: u64) -> Self {
                Self(id)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

registry_id! {
    /// Identifier of a registered follower in the replica registry.
    ReplicaId
}

registry_id! {
    /// Identifier of a pending WAIT reply.
    WaitId
}

registry_id! {
    /// Identifier of a blocked stream read awaiting new entries.
    StreamWaiterId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_order_is_lexicographic() {
        assert!(StreamId::new(1, 1) < StreamId::new(1, 2));
        assert!(StreamId::new(1, 9) < StreamId::new(2, 0));
        assert!(StreamId::new(2, 0) > StreamId::new(1, u64::MAX));
        assert_eq!(StreamId::new(3, 4), StreamId::new(3, 4));
    }

    #[test]
    fn stream_id_next() {
        assert_eq!(StreamId::new(1, 1).next(), StreamId::new(1, 2));
        assert_eq!(StreamId::new(1, u64::MAX).next(), StreamId::new(2, 0));
        assert_eq!(StreamId::MAX.next(), StreamId::MAX);
    }

    #[test]
    fn stream_id_display() {
        assert_eq!(StreamId::new(1526919030474, 55).to_string(), "1526919030474-55");
    }

    #[test]
    fn input_id_forms() {
        assert_eq!("*".parse::<InputStreamId>().unwrap(), InputStreamId::Wildcard);
        assert_eq!(
            "5-*".parse::<InputStreamId>().unwrap(),
            InputStreamId::SeqWildcard { ms: 5 }
        );
        assert_eq!(
            "5-3".parse::<InputStreamId>().unwrap(),
            InputStreamId::Exact(StreamId::new(5, 3))
        );
        // Bare milliseconds shorthand
        assert_eq!(
            "0".parse::<InputStreamId>().unwrap(),
            InputStreamId::Exact(StreamId::new(0, 0))
        );
    }

    #[test]
    fn input_id_rejects_garbage() {
        assert_eq!(
            "".parse::<InputStreamId>().unwrap_err(),
            StreamIdParseError::Empty
        );
        assert!(matches!(
            "abc".parse::<InputStreamId>().unwrap_err(),
            StreamIdParseError::BadMs(_)
        ));
        assert!(matches!(
            "1-x".parse::<InputStreamId>().unwrap_err(),
            StreamIdParseError::BadSeq(_)
        ));
        assert!(matches!(
            "x-*".parse::<InputStreamId>().unwrap_err(),
            StreamIdParseError::BadMs(_)
        ));
    }

    #[test]
    fn bound_id_forms() {
        assert_eq!("-".parse::<BoundStreamId>().unwrap(), BoundStreamId::Unbound);
        assert_eq!("+".parse::<BoundStreamId>().unwrap(), BoundStreamId::Unbound);
        assert_eq!(
            "7".parse::<BoundStreamId>().unwrap(),
            BoundStreamId::Exact(StreamId::new(7, 0))
        );
        assert_eq!(
            "7-2".parse::<BoundStreamId>().unwrap(),
            BoundStreamId::Exact(StreamId::new(7, 2))
        );
    }

    #[test]
    fn bound_id_resolution() {
        assert_eq!(BoundStreamId::Unbound.resolve(StreamId::MIN), StreamId::MIN);
        assert_eq!(BoundStreamId::Unbound.resolve(StreamId::MAX), StreamId::MAX);
        assert_eq!(
            BoundStreamId::Exact(StreamId::new(1, 2)).resolve(StreamId::MAX),
            StreamId::new(1, 2)
        );
    }

    #[test]
    fn read_id_forms() {
        assert_eq!("$".parse::<ReadStreamId>().unwrap(), ReadStreamId::Latest);
        assert_eq!(
            "9-9".parse::<ReadStreamId>().unwrap(),
            ReadStreamId::Exact(StreamId::new(9, 9))
        );
    }

    #[test]
    fn registry_ids_round_trip() {
        let id = ReplicaId::from(42);
        assert_eq!(u64::from(id), 42);
        assert_eq!(id.to_string(), "42");
        assert!(WaitId::new(1) < WaitId::new(2));
        assert_eq!(StreamWaiterId::new(7), StreamWaiterId::from(7));
    }
}
