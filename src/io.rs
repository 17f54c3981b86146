//! Capability interfaces the engine consumes: the user state machine and
//! the disk/network/clock backend.
//!
//! The engine never blocks. Submitting work (an append, a send, a snapshot
//! read or write) enqueues it with the backend and returns immediately; the
//! outcome arrives later as an [`IoEvent`] completion, interleaved with
//! ticks and received messages. The driver loop pulls one event at a time
//! through [`RaftIo::next_event`], which is what makes every mutation of
//! the engine run under mutual exclusion without any internal locks.

use crate::configuration::Configuration;
use crate::log::Entry;
use crate::message::Message;
use crate::utils::Result;
use crate::{Index, ServerId, Term, TimeMs};

use async_trait::async_trait;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// The details of a snapshot, as taken, stored or loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last entry covered by the snapshot.
    pub last_index: Index,

    /// Term of the entry at `last_index`.
    pub last_term: Term,

    /// Last committed configuration as of `last_index`.
    pub configuration: Configuration,

    /// Index at which `configuration` was committed.
    pub configuration_index: Index,

    /// Snapshot content. A freshly taken snapshot may span several buffers;
    /// a loaded one always holds a single buffer.
    pub data: Vec<Bytes>,
}

impl Snapshot {
    /// The snapshot content as one contiguous buffer.
    pub fn flat_data(&self) -> Bytes {
        match self.data.as_slice() {
            [single] => single.clone(),
            bufs => {
                let mut flat =
                    Vec::with_capacity(bufs.iter().map(Bytes::len).sum());
                for buf in bufs {
                    flat.extend_from_slice(buf);
                }
                Bytes::from(flat)
            }
        }
    }
}

/// Persistent state handed back by [`RaftIo::load`] at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    /// Latest term the server has seen.
    pub term: Term,

    /// Who the server voted for in that term, if anyone.
    pub voted_for: Option<ServerId>,

    /// Most recent snapshot on disk, if any.
    pub snapshot: Option<Snapshot>,

    /// Index of the first loaded entry.
    pub start_index: Index,

    /// Entries of the stored log from `start_index` onwards.
    pub entries: Vec<Entry>,
}

/// Completion events, ticks and received messages delivered by the I/O
/// backend to the driver loop.
#[derive(Debug)]
pub enum IoEvent {
    /// The periodic tick elapsed.
    Tick,

    /// An RPC message arrived from a peer.
    Received(Message),

    /// An asynchronous send to the given server finished.
    Sent {
        to: ServerId,
        result: Result<()>,
    },

    /// The append submitted with the given sequence number finished.
    /// Appends complete strictly in submission order.
    Appended {
        seq: u64,
        result: Result<()>,
    },

    /// The pending snapshot write finished.
    SnapshotStored {
        result: Result<()>,
    },

    /// The pending snapshot read finished.
    SnapshotLoaded {
        result: Result<Snapshot>,
    },

    /// The backend finished closing; no further events will arrive.
    Closed,
}

/// Disk, network, clock and randomness backend interface.
///
/// Ordering contracts: messages submitted with `send` to the same
/// destination are delivered in submission order; appends complete in
/// submission order; at most one `snapshot_put` and one `snapshot_get` are
/// outstanding at a time.
#[async_trait]
pub trait RaftIo {
    /// Hands the backend its server identity. Invoked once, first.
    fn init(&mut self, id: ServerId, address: &str) -> Result<()>;

    /// Synchronously loads persisted term, vote, snapshot and log entries.
    /// Invoked exactly once, before any append or truncate.
    fn load(&mut self) -> Result<LoadedState>;

    /// Starts the backend: from now on it must produce a `Tick` event every
    /// `tick_ms` milliseconds and `Received` events for incoming messages.
    fn start(&mut self, tick_ms: u64) -> Result<()>;

    /// Synchronously persists the given configuration as the first log
    /// entry of a brand-new cluster, with term 1 and a nil vote. Must fail
    /// with `CantBootstrap` if any state exists already.
    fn bootstrap(&mut self, configuration: &Configuration) -> Result<()>;

    /// Synchronously force-appends the given configuration as the last
    /// stored log entry, for disaster recovery of a stopped server.
    fn recover(&mut self, configuration: &Configuration) -> Result<()>;

    /// Synchronously and durably persists the current term and a nil vote.
    fn set_term(&mut self, term: Term) -> Result<()>;

    /// Synchronously and durably persists the vote for the current term.
    fn set_vote(&mut self, voted_for: Option<ServerId>) -> Result<()>;

    /// Asynchronously sends a message; completion arrives as `Sent`.
    fn send(
        &mut self,
        to: ServerId,
        to_address: &str,
        message: Message,
    ) -> Result<()>;

    /// Asynchronously appends entries to the stored log; completion
    /// arrives as `Appended` carrying back `seq`.
    fn append(&mut self, seq: u64, entries: Vec<Entry>) -> Result<()>;

    /// Asynchronously deletes all stored entries from `index` onwards.
    fn truncate(&mut self, index: Index) -> Result<()>;

    /// Asynchronously persists a snapshot, deleting stored entries older
    /// than `snapshot.last_index - trailing` (all of them if `trailing` is
    /// zero). Completion arrives as `SnapshotStored`.
    fn snapshot_put(&mut self, trailing: u64, snapshot: Snapshot)
        -> Result<()>;

    /// Asynchronously loads the most recent snapshot; completion arrives
    /// as `SnapshotLoaded`.
    fn snapshot_get(&mut self) -> Result<()>;

    /// Current time in milliseconds since an arbitrary epoch.
    fn time(&self) -> TimeMs;

    /// A random integer in `[min, max)`.
    fn random(&mut self, min: u64, max: u64) -> u64;

    /// Waits for the next tick, received message or completion. All engine
    /// mutation happens downstream of this single suspension point.
    async fn next_event(&mut self) -> Result<IoEvent>;

    /// Starts closing: cancels what can be canceled, completes the rest,
    /// then emits a final `Closed` event.
    fn close(&mut self) -> Result<()>;
}

/// Interface for the user-implemented state machine replicated by the
/// engine.
pub trait StateMachine {
    /// Opaque result of applying one command, handed back to the client
    /// whose apply request carried it.
    type Output: Send + std::fmt::Debug + 'static;

    /// Applies a committed command entry to the state machine.
    fn apply(&mut self, payload: &Bytes) -> Result<Self::Output>;

    /// Takes a snapshot of the state machine.
    fn snapshot(&mut self) -> Result<Vec<Bytes>>;

    /// Restores the state machine from snapshot content.
    fn restore(&mut self, data: Bytes) -> Result<()>;
}
