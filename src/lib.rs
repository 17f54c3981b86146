//! Public interface to the Skiff core library.
//!
//! Skiff is the consensus core of a Raft implementation: a single-server
//! state object that, composed with peers, provides a replicated log over a
//! user state machine. Disk, network, clock and randomness are capabilities
//! supplied by the embedding application through the [`io::RaftIo`] trait;
//! the replicated application state lives behind [`io::StateMachine`].

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod configuration;
pub mod io;
pub mod log;
pub mod message;
pub mod progress;
pub mod server;
pub mod testing;

/// Server ID type; valid IDs are non-zero.
pub type ServerId = u64;

/// Term number type, defined for better code readability.
pub type Term = u64;

/// Log index type; the first real entry of the log has index 1.
pub type Index = u64;

/// Time point in milliseconds since an arbitrary epoch of the I/O clock.
pub type TimeMs = u64;

pub use configuration::{Configuration, Role};
pub use io::{IoEvent, LoadedState, RaftIo, Snapshot, StateMachine};
pub use log::{Entry, EntryKind, RaftLog};
pub use message::{Message, MessageKind};
pub use progress::{Progress, ReplicationState};
pub use server::{RaftServer, ServerConfig, State};
pub use utils::{Result, SkiffError};
