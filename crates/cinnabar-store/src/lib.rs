//! # cinnabar-store: In-memory storage for Cinnabar
//!
//! The keyspace maps each key to exactly one of two value kinds:
//!
//! - a **string value** with optional absolute-time expiry, compared against
//!   a monotonic clock at millisecond precision and lazily removed on the
//!   next access once passed;
//! - a **stream value**: an ordered map from composite `(ms, seq)` entry IDs
//!   to field/value pair lists, with strictly increasing IDs per key.
//!
//! [`Store`] is the pure, directly-testable core. [`SharedStore`] wraps it
//! in the shared single-threaded handle the rest of the system uses, and is
//! where blocked-reader callbacks fire — after the mutable borrow of the
//! underlying store is released, so a callback is free to touch the store
//! again.
//!
//! The [`snapshot`] module reads the startup snapshot file (a subset of the
//! RDB format) through the [`Store::restore`] contract, and carries the
//! canonical empty snapshot blob served to followers during a full resync.

mod error;
pub mod snapshot;
mod store;
mod value;

pub use error::{StoreError, StoreResult};
pub use store::{ResolvedRead, SharedStore, Store, StreamEntry, StreamReadResult, ValueKind};
pub use value::{StringValue, StreamValue, Value};
