//! # cinnabar-replication: Write fan-out and follower tracking
//!
//! The [`ReplicationHub`] sits between the server session and raw storage
//! on a leader. Every applied write is re-encoded in canonical form and
//! enqueued to each follower in `Write` state, with per-follower counters
//! of bytes pushed and bytes acknowledged. `WAIT` is serviced here: a wait
//! entry tracks which lagging followers were nudged with `REPLCONF GETACK`
//! and resolves when enough acknowledgements arrive or its timer fires.
//!
//! Follower connections register an *outbox slot* — a closure that enqueues
//! a frame onto that connection's pending output. Outbox and reply slots
//! are invoked only after the hub's internal borrow is released, so a slot
//! is free to re-enter the hub.

mod hub;

pub use hub::{ReplicaState, ReplicationHub};
