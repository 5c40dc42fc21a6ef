//! tickloop-server: tick-driven connection server loop
//!
//! A minimal accept loop plus dispatch loop suitable as the kernel of a
//! small multiplayer game or IoT server.
//!
//! # Architecture
//!
//! Every tick runs three stages in a fixed order:
//!
//! - Transport readiness poll
//! - [`ConnectionReaper`]: compact invalidated entries, accept new connections
//! - [`EventDispatcher`]: drain each connection's events on a bounded worker pool
//!
//! Disconnects only invalidate a table entry; the entry is removed by the
//! next tick's reaping pass. Table positions are not stable across ticks,
//! so connections are always referred to by [`ConnectionId`].

/// Configuration management for the server
pub mod config;

/// Authoritative connection list
pub mod connection_table;

/// Parallel per-connection event pump
pub mod dispatcher;

/// Error types and result aliases
pub mod error;

/// Transport interface and implementations
pub mod network;

/// Reference application protocol
pub mod protocol;

/// Table compaction and connection accept
pub mod reaper;

/// Tick orchestration and lifecycle
pub mod server;

pub use config::Config;
pub use connection_table::{ConnectionHandle, ConnectionTable};
pub use dispatcher::{EventDispatcher, Handler};
pub use error::{Error, Result};
pub use network::{ConnectionId, NetEvent, Transport};
pub use reaper::ConnectionReaper;
pub use server::{LoopState, ServerLoop, ShutdownHandle, TickReport};
