//! # cinnabar-server: The Cinnabar server daemon
//!
//! This crate wires the pieces into a running node: non-blocking
//! connection handling over the reactor, the per-connection *talker* state
//! machines, and the TCP entry points for both roles.
//!
//! ## Architecture
//!
//! The server runs a single-threaded poll-based event loop — explicit
//! control flow, no async runtime.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       cinnabar-server                        │
//! │  ┌──────────┐   ┌─────────────────┐   ┌───────────────────┐  │
//! │  │ Listener │ → │ ConnectionHandler│ → │ Talker            │  │
//! │  │ (TCP)    │   │ (reactor poll)   │   │ (→ store / hub)   │  │
//! │  └──────────┘   └─────────────────┘   └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A leader accepts clients and fans writes out through the replication
//! hub; a follower additionally dials its leader, performs the
//! `PING → REPLCONF → PSYNC` handshake, ingests the snapshot, and applies
//! the streamed writes while acknowledging byte offsets.
//!
//! ## Usage
//!
//! ```ignore
//! use cinnabar_server::{Server, ServerConfig};
//!
//! let config = ServerConfig::new(6379);
//! let server = Server::new(config)?;
//! server.run()?;
//! ```

mod config;
mod connection;
mod context;
mod error;
mod info;
mod replica_talker;
mod server;
mod server_talker;
mod talker;

pub use config::{DEFAULT_PORT, ServerConfig};
pub use connection::{ConnectionHandler, Connections};
pub use context::ServerContext;
pub use error::{ServerError, ServerResult};
pub use info::{ServerInfo, generate_replid};
pub use replica_talker::ReplicaTalker;
pub use server::Server;
pub use server_talker::ServerTalker;
pub use talker::{Outlet, Talker};
