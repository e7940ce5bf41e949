//! Stored value kinds.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use cinnabar_types::StreamId;

/// A string value with optional absolute expiry.
///
/// Expiry is an [`Instant`] on the monotonic clock; a value whose
/// `expire_at` has passed is semantically absent and is removed by the next
/// access that observes it.
#[derive(Debug, Clone)]
pub struct StringValue {
    pub data: Bytes,
    pub created_at: Instant,
    pub expire_at: Option<Instant>,
}

impl StringValue {
    pub fn new(data: Bytes, expire_at: Option<Instant>) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            expire_at,
        }
    }

    /// Whether the value's expiry has passed as of `now`.
    pub fn expired_at(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// An append-only stream: entry IDs to field/value pair lists.
///
/// The ordered map gives `log n` insertion and range queries; cross-ID
/// order is strictly increasing and pairs keep insertion order within one
/// entry.
#[derive(Debug, Clone, Default)]
pub struct StreamValue {
    pub entries: BTreeMap<StreamId, Vec<(Bytes, Bytes)>>,
}

impl StreamValue {
    /// The greatest entry ID present, if any.
    pub fn top(&self) -> Option<StreamId> {
        self.entries.last_key_value().map(|(id, _)| *id)
    }
}

/// What a key maps to.
#[derive(Debug, Clone)]
pub enum Value {
    Str(StringValue),
    Stream(StreamValue),
}
