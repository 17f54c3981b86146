//! Deterministic in-memory capability implementations, used by the test
//! suites to run servers (and whole clusters) without real disks, sockets
//! or clocks.
//!
//! [`MemIo`] persists into plain vectors, completes every asynchronous
//! request instantly by queueing its completion event, and parks outgoing
//! messages in an outbox. The paired [`MemIoHandle`] lets a test advance
//! the clock, drain the outbox and completion queue, inspect persisted
//! state, and inject faults.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::configuration::Configuration;
use crate::io::{IoEvent, LoadedState, RaftIo, Snapshot, StateMachine};
use crate::log::{Entry, EntryKind};
use crate::message::Message;
use crate::utils::{Result, SkiffError};
use crate::{Index, ServerId, Term, TimeMs};

use async_trait::async_trait;

use bytes::Bytes;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Default)]
struct MemIoShared {
    id: ServerId,
    address: String,

    term: Term,
    voted_for: Option<ServerId>,
    start_index: Index,
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,

    outbox: VecDeque<(ServerId, Message)>,
    events: VecDeque<IoEvent>,
    now: TimeMs,
    tick_ms: u64,
    closed: bool,
    fail_next_append: bool,
}

/// In-memory I/O capability.
pub struct MemIo {
    shared: Arc<Mutex<MemIoShared>>,
    rng: StdRng,
}

/// Test-side handle onto a [`MemIo`]'s state.
#[derive(Clone)]
pub struct MemIoHandle {
    shared: Arc<Mutex<MemIoShared>>,
}

impl MemIo {
    /// Creates a fresh in-memory I/O with a seeded random source, paired
    /// with its inspection handle.
    pub fn new(seed: u64) -> (MemIo, MemIoHandle) {
        let shared = Arc::new(Mutex::new(MemIoShared {
            start_index: 1,
            ..Default::default()
        }));
        let handle = MemIoHandle {
            shared: shared.clone(),
        };
        (
            MemIo {
                shared,
                rng: StdRng::seed_from_u64(seed),
            },
            handle,
        )
    }
}

impl MemIoHandle {
    /// Moves the clock forward.
    pub fn advance(&self, ms: TimeMs) {
        self.shared.lock().unwrap().now += ms;
    }

    /// The current clock reading.
    pub fn now(&self) -> TimeMs {
        self.shared.lock().unwrap().now
    }

    /// Drains all queued completion events.
    pub fn take_events(&self) -> Vec<IoEvent> {
        self.shared.lock().unwrap().events.drain(..).collect()
    }

    /// How many completion events are queued, without consuming them.
    pub fn pending_events(&self) -> usize {
        self.shared.lock().unwrap().events.len()
    }

    /// Drains all messages sent so far.
    pub fn take_outbox(&self) -> Vec<(ServerId, Message)> {
        self.shared.lock().unwrap().outbox.drain(..).collect()
    }

    /// Makes the next append complete with an I/O error.
    pub fn fail_next_append(&self) {
        self.shared.lock().unwrap().fail_next_append = true;
    }

    /// Seeds a snapshot as if one had been persisted earlier.
    pub fn seed_snapshot(&self, snapshot: Snapshot) {
        let mut shared = self.shared.lock().unwrap();
        shared.start_index = snapshot.last_index + 1;
        shared.snapshot = Some(snapshot);
    }

    /// Seeds the persisted term.
    pub fn seed_term(&self, term: Term) {
        self.shared.lock().unwrap().term = term;
    }

    /// The persisted current term.
    pub fn persisted_term(&self) -> Term {
        self.shared.lock().unwrap().term
    }

    /// The persisted vote.
    pub fn persisted_vote(&self) -> Option<ServerId> {
        self.shared.lock().unwrap().voted_for
    }

    /// The persisted log entries.
    pub fn persisted_entries(&self) -> Vec<Entry> {
        self.shared.lock().unwrap().entries.clone()
    }

    /// The persisted snapshot, if any.
    pub fn persisted_snapshot(&self) -> Option<Snapshot> {
        self.shared.lock().unwrap().snapshot.clone()
    }

    /// Whether `close` has been requested.
    pub fn closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    /// The identity the engine registered with `init`.
    pub fn identity(&self) -> (ServerId, String) {
        let shared = self.shared.lock().unwrap();
        (shared.id, shared.address.clone())
    }

    /// The tick period the engine requested at `start`, in ms.
    pub fn tick_ms(&self) -> u64 {
        self.shared.lock().unwrap().tick_ms
    }
}

#[async_trait]
impl RaftIo for MemIo {
    fn init(&mut self, id: ServerId, address: &str) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.id = id;
        shared.address = address.to_owned();
        Ok(())
    }

    fn load(&mut self) -> Result<LoadedState> {
        let shared = self.shared.lock().unwrap();
        Ok(LoadedState {
            term: shared.term,
            voted_for: shared.voted_for,
            snapshot: shared.snapshot.clone(),
            start_index: shared.start_index,
            entries: shared.entries.clone(),
        })
    }

    fn start(&mut self, tick_ms: u64) -> Result<()> {
        self.shared.lock().unwrap().tick_ms = tick_ms;
        Ok(())
    }

    fn bootstrap(&mut self, configuration: &Configuration) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.term != 0
            || !shared.entries.is_empty()
            || shared.snapshot.is_some()
        {
            return Err(SkiffError::CantBootstrap);
        }
        shared.term = 1;
        shared.voted_for = None;
        shared.start_index = 1;
        shared.entries = vec![Entry::new(
            1,
            EntryKind::ConfigChange,
            configuration.encode(),
        )];
        Ok(())
    }

    fn recover(&mut self, configuration: &Configuration) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let term = shared
            .entries
            .last()
            .map(|e| e.term)
            .unwrap_or(1)
            .max(shared.term);
        shared.entries.push(Entry::new(
            term,
            EntryKind::ConfigChange,
            configuration.encode(),
        ));
        Ok(())
    }

    fn set_term(&mut self, term: Term) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.term = term;
        shared.voted_for = None;
        Ok(())
    }

    fn set_vote(&mut self, voted_for: Option<ServerId>) -> Result<()> {
        self.shared.lock().unwrap().voted_for = voted_for;
        Ok(())
    }

    fn send(
        &mut self,
        to: ServerId,
        _to_address: &str,
        message: Message,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.outbox.push_back((to, message));
        shared
            .events
            .push_back(IoEvent::Sent { to, result: Ok(()) });
        Ok(())
    }

    fn append(&mut self, seq: u64, entries: Vec<Entry>) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.fail_next_append {
            shared.fail_next_append = false;
            shared.events.push_back(IoEvent::Appended {
                seq,
                result: Err(SkiffError::Io("injected append fault".into())),
            });
            return Ok(());
        }
        shared.entries.extend(entries);
        shared
            .events
            .push_back(IoEvent::Appended { seq, result: Ok(()) });
        Ok(())
    }

    fn truncate(&mut self, index: Index) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let start_index = shared.start_index;
        if index < start_index {
            shared.entries.clear();
        } else {
            shared.entries.truncate((index - start_index) as usize);
        }
        Ok(())
    }

    fn snapshot_put(
        &mut self,
        trailing: u64,
        snapshot: Snapshot,
    ) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let cut = snapshot.last_index.saturating_sub(trailing);
        if cut >= shared.start_index {
            let drop_n = (cut - shared.start_index + 1) as usize;
            let drop_n = drop_n.min(shared.entries.len());
            shared.entries.drain(..drop_n);
            shared.start_index = cut + 1;
        }
        shared.snapshot = Some(snapshot);
        shared
            .events
            .push_back(IoEvent::SnapshotStored { result: Ok(()) });
        Ok(())
    }

    fn snapshot_get(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let result = match &shared.snapshot {
            Some(snapshot) => Ok(Snapshot {
                last_index: snapshot.last_index,
                last_term: snapshot.last_term,
                configuration: snapshot.configuration.clone(),
                configuration_index: snapshot.configuration_index,
                data: vec![snapshot.flat_data()],
            }),
            None => Err(SkiffError::NotFound),
        };
        shared.events.push_back(IoEvent::SnapshotLoaded { result });
        Ok(())
    }

    fn time(&self) -> TimeMs {
        self.shared.lock().unwrap().now
    }

    fn random(&mut self, min: u64, max: u64) -> u64 {
        self.rng.gen_range(min..max)
    }

    async fn next_event(&mut self) -> Result<IoEvent> {
        loop {
            if let Some(event) =
                self.shared.lock().unwrap().events.pop_front()
            {
                return Ok(event);
            }
            tokio::task::yield_now().await;
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        shared.events.push_back(IoEvent::Closed);
        Ok(())
    }
}

type FsmState = Vec<Bytes>;

#[derive(Debug, Default)]
struct MemFsmShared {
    applied: FsmState,
    fail_next_apply: bool,
}

/// In-memory state machine: the state is simply the list of applied
/// command payloads, and applying echoes the payload back.
pub struct MemFsm {
    shared: Arc<Mutex<MemFsmShared>>,
}

/// Test-side handle onto a [`MemFsm`]'s state.
#[derive(Clone)]
pub struct MemFsmHandle {
    shared: Arc<Mutex<MemFsmShared>>,
}

impl MemFsm {
    /// Creates an empty state machine paired with its inspection handle.
    pub fn new() -> (MemFsm, MemFsmHandle) {
        let shared = Arc::new(Mutex::new(MemFsmShared::default()));
        let handle = MemFsmHandle {
            shared: shared.clone(),
        };
        (MemFsm { shared }, handle)
    }

    /// Encodes an applied-payload list the way `snapshot` does, for
    /// seeding snapshots in tests.
    pub fn encode_state(applied: &[Bytes]) -> Bytes {
        Bytes::from(rmp_serde::encode::to_vec(applied).unwrap())
    }
}

impl MemFsmHandle {
    /// The payloads applied so far, in order.
    pub fn applied(&self) -> Vec<Bytes> {
        self.shared.lock().unwrap().applied.clone()
    }

    /// Makes the next apply fail.
    pub fn fail_next_apply(&self) {
        self.shared.lock().unwrap().fail_next_apply = true;
    }
}

impl StateMachine for MemFsm {
    type Output = Bytes;

    fn apply(&mut self, payload: &Bytes) -> Result<Bytes> {
        let mut shared = self.shared.lock().unwrap();
        if shared.fail_next_apply {
            shared.fail_next_apply = false;
            return Err(SkiffError::Invalid("injected apply fault".into()));
        }
        shared.applied.push(payload.clone());
        Ok(payload.clone())
    }

    fn snapshot(&mut self) -> Result<Vec<Bytes>> {
        let shared = self.shared.lock().unwrap();
        Ok(vec![Bytes::from(rmp_serde::encode::to_vec(
            &shared.applied,
        )?)])
    }

    fn restore(&mut self, data: Bytes) -> Result<()> {
        let applied: FsmState = if data.is_empty() {
            vec![]
        } else {
            rmp_serde::decode::from_slice(&data)?
        };
        self.shared.lock().unwrap().applied = applied;
        Ok(())
    }
}

#[cfg(test)]
mod testing_tests {
    use super::*;

    #[test]
    fn mem_io_bootstrap_once() {
        let (mut io, handle) = MemIo::new(1);
        io.init(1, "s1").unwrap();
        let mut conf = Configuration::new();
        conf.add(1, "s1", crate::configuration::Role::Voter).unwrap();
        io.bootstrap(&conf).unwrap();
        assert_eq!(io.bootstrap(&conf).err(), Some(SkiffError::CantBootstrap));
        assert_eq!(handle.persisted_term(), 1);
        assert_eq!(handle.persisted_entries().len(), 1);
    }

    #[test]
    fn mem_io_append_truncate() {
        let (mut io, handle) = MemIo::new(1);
        io.append(
            0,
            vec![
                Entry::new(1, EntryKind::Command, Bytes::from_static(b"a")),
                Entry::new(1, EntryKind::Command, Bytes::from_static(b"b")),
            ],
        )
        .unwrap();
        io.truncate(2).unwrap();
        assert_eq!(handle.persisted_entries().len(), 1);
        assert!(matches!(
            handle.take_events()[..],
            [IoEvent::Appended { seq: 0, result: Ok(()) }]
        ));
    }

    #[test]
    fn mem_fsm_snapshot_restore_round_trip() {
        let (mut fsm, _) = MemFsm::new();
        fsm.apply(&Bytes::from_static(b"a")).unwrap();
        fsm.apply(&Bytes::from_static(b"b")).unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let (mut other, other_handle) = MemFsm::new();
        other.restore(snapshot[0].clone()).unwrap();
        assert_eq!(
            other_handle.applied(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn mem_io_random_in_range() {
        let (mut io, _) = MemIo::new(123);
        for _ in 0..100 {
            let v = io.random(1000, 2000);
            assert!((1000..2000).contains(&v));
        }
    }
}
