//! # cinnabar-reactor: Cooperative scheduling for Cinnabar
//!
//! The server runs on a single OS thread with explicit control flow — no
//! async runtime, no worker pools, no locks. This crate provides the two
//! pieces that make that work:
//!
//! - [`EventLoop`]: a cooperative scheduler draining four job queues per
//!   tick (once-jobs, repeating jobs, timers, then a bounded slice of the
//!   internal event queue), with cancellation through [`JobHandle`].
//! - [`Poller`]: a thin wrapper over `mio::Poll` mapping registered sources
//!   to listener closures and translating OS readiness into the abstract
//!   [`IoEventKind`] set, delivered in a fixed order.
//!
//! Handlers never block. "Call me again later" is expressed by posting a
//! job, arming a timer, or waiting for the poller to report readiness.

mod event_loop;
mod poller;

pub use event_loop::{EventLoop, JobHandle, LoopHandle};
pub use poller::{IoEventKind, Poller};
