//! The consensus engine: a single server's state object, driven by the
//! I/O capability's ticks, received messages and completion events.

mod durability;
mod execution;
mod leadership;
mod messages;
mod recovery;
mod replication;
mod request;
mod snapshot;

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::configuration::Configuration;
use crate::io::{IoEvent, RaftIo, StateMachine};
use crate::log::RaftLog;
use crate::message::{Message, MessageKind};
use crate::progress::ProgressTable;
use crate::utils::{Result, SkiffError};
use crate::{Index, ServerId, Term, TimeMs};

use serde::Deserialize;

use durability::PendingAppend;
use request::{
    ApplyRequest, BarrierRequest, ChangeRequest, PromotionRound,
    TransferRequest,
};
use snapshot::PendingSnapshot;

/// Engine state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created but not started, or closed.
    Unavailable,

    /// Accepts entries from a leader.
    Follower,

    /// Campaigning to become leader.
    Candidate,

    /// Coordinates log replication.
    Leader,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unavailable => write!(f, "Unavailable"),
            State::Follower => write!(f, "Follower"),
            State::Candidate => write!(f, "Candidate"),
            State::Leader => write!(f, "Leader"),
        }
    }
}

/// Tunable parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base election timeout in millisecs; each timer arming randomizes
    /// the effective timeout between 1x and 2x this value.
    pub election_timeout: u64,

    /// Interval of leader AppendEntries heartbeats per follower, in
    /// millisecs. Also the tick period requested from the I/O.
    pub heartbeat_timeout: u64,

    /// Number of applied entries since the last snapshot that triggers
    /// taking a new one.
    pub snapshot_threshold: u64,

    /// Number of already-snapshotted entries retained in the log for
    /// follower catch-up. 0 drops everything up to the snapshot.
    pub snapshot_trailing: u64,

    /// Max number of sync rounds granted to a promotee to catch up before
    /// the promotion fails.
    pub max_catch_up_rounds: u64,

    /// Max entries shipped in one AppendEntries while pipelining.
    pub max_append_entries: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            election_timeout: 1000,
            heartbeat_timeout: 100,
            snapshot_threshold: 1024,
            snapshot_trailing: 128,
            max_catch_up_rounds: 10,
            max_append_entries: 64,
        }
    }
}

/// A single raft server instance.
///
/// The engine is single-threaded cooperative: every mutation happens
/// inside [`RaftServer::step`] or a client request method, invoked one at
/// a time. Methods submitting I/O work never block; outcomes come back as
/// later events.
pub struct RaftServer<S: StateMachine, I: RaftIo> {
    /// My server ID.
    id: ServerId,

    /// My network address, opaque to the engine.
    address: String,

    /// Tunable parameters struct.
    config: ServerConfig,

    /// Disk/network/clock capability.
    io: I,

    /// User state machine commands are applied to.
    fsm: S,

    /// Current engine state.
    state: State,

    /// Latest term this server has seen; durable before any reply
    /// depends on it.
    current_term: Term,

    /// Candidate that received my vote in the current term, if any.
    voted_for: Option<ServerId>,

    /// In-memory cache of the persisted log.
    log: RaftLog,

    /// Membership configuration currently in effect.
    configuration: Configuration,

    /// Most recent committed configuration, kept for rollback when an
    /// uncommitted configuration entry gets truncated away.
    committed_configuration: Configuration,

    /// Log index the committed configuration was appended at, or 0.
    configuration_index: Index,

    /// Log index of the in-flight uncommitted configuration, or 0.
    configuration_uncommitted_index: Index,

    /// Highest log index known to be committed.
    commit_index: Index,

    /// Highest log index applied to the state machine.
    last_applied: Index,

    /// Highest log index durably stored on disk.
    last_stored: Index,

    /// Commit watermark most recently advertised by the leader, clamped
    /// against `last_stored` whenever either side moves.
    leader_commit_hint: Index,

    /// Who I believe is the current leader, if anyone.
    current_leader: Option<(ServerId, String)>,

    /// Timestamp of the last valid leader contact.
    last_leader_contact: TimeMs,

    /// When the election timer was last armed.
    election_timer_start: TimeMs,

    /// Effective timeout picked at the last arming, in `[T, 2T)`.
    randomized_election_timeout: TimeMs,

    /// Votes received in the current candidacy, keyed by voter.
    votes: HashMap<ServerId, bool>,

    /// Per-member replication progress; leader only.
    progress: ProgressTable,

    /// Outstanding apply requests, in submission (= index) order.
    apply_reqs: VecDeque<ApplyRequest<S::Output>>,

    /// Outstanding barrier requests, in index order.
    barrier_reqs: VecDeque<BarrierRequest>,

    /// Configuration change whose entry is in the log but uncommitted.
    pending_change: Option<ChangeRequest>,

    /// Promotion waiting for its sync rounds to complete.
    promotion: Option<PromotionRound>,

    /// In-progress leadership transfer.
    transfer: Option<TransferRequest>,

    /// Sequence number of the next append submission.
    append_seq: u64,

    /// Appends submitted to the I/O and not yet completed, in order.
    pending_appends: VecDeque<PendingAppend>,

    /// Snapshot write currently in flight, if any.
    pending_snapshot: Option<PendingSnapshot>,

    /// Whether a snapshot read is in flight.
    snapshot_get_inflight: bool,

    /// Followers waiting for the snapshot read to come back.
    snapshot_waiters: Vec<ServerId>,

    /// Whether `start` has completed.
    started: bool,

    /// Whether `close` has begun.
    closing: bool,

    /// Human-readable description of the most recent failure.
    errmsg: String,
}

// RaftServer lifecycle, event dispatch and tick driver
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Creates an inert server instance around the given capabilities.
    /// `config_str` optionally overrides tunables as a TOML fragment.
    pub fn new(
        id: ServerId,
        address: impl Into<String>,
        fsm: S,
        mut io: I,
        config_str: Option<&str>,
    ) -> Result<Self> {
        if id == 0 {
            return Err(SkiffError::BadId);
        }
        let config = parsed_config!(config_str => ServerConfig;
                                    election_timeout, heartbeat_timeout,
                                    snapshot_threshold, snapshot_trailing,
                                    max_catch_up_rounds, max_append_entries)?;
        if config.heartbeat_timeout == 0
            || config.election_timeout <= config.heartbeat_timeout
        {
            return Err(SkiffError::Invalid(format!(
                "election timeout {} must exceed heartbeat timeout {}",
                config.election_timeout, config.heartbeat_timeout
            )));
        }

        let address = address.into();
        io.init(id, &address)?;

        Ok(RaftServer {
            id,
            address,
            config,
            io,
            fsm,
            state: State::Unavailable,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            configuration: Configuration::new(),
            committed_configuration: Configuration::new(),
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            commit_index: 0,
            last_applied: 0,
            last_stored: 0,
            leader_commit_hint: 0,
            current_leader: None,
            last_leader_contact: 0,
            election_timer_start: 0,
            randomized_election_timeout: 0,
            votes: HashMap::new(),
            progress: ProgressTable::default(),
            apply_reqs: VecDeque::new(),
            barrier_reqs: VecDeque::new(),
            pending_change: None,
            promotion: None,
            transfer: None,
            append_seq: 0,
            pending_appends: VecDeque::new(),
            pending_snapshot: None,
            snapshot_get_inflight: false,
            snapshot_waiters: vec![],
            started: false,
            closing: false,
            errmsg: String::new(),
        })
    }

    /// Feeds one I/O event into the engine. Together with the client
    /// request methods this is the only mutation entry point; the I/O
    /// guarantees events are delivered one at a time.
    pub fn step(&mut self, event: IoEvent) -> Result<()> {
        match event {
            IoEvent::Tick => self.handle_tick(),
            IoEvent::Received(msg) => self.handle_msg_recv(msg),
            IoEvent::Sent { to, result } => self.handle_sent(to, result),
            IoEvent::Appended { seq, result } => {
                self.handle_appended(seq, result)
            }
            IoEvent::SnapshotStored { result } => {
                self.handle_snapshot_stored(result)
            }
            IoEvent::SnapshotLoaded { result } => {
                self.handle_snapshot_loaded(result)
            }
            IoEvent::Closed => {
                pf_debug!(self.id; "io closed, engine unavailable");
                self.state = State::Unavailable;
                Ok(())
            }
        }
    }

    /// Drives the engine until closed: awaits events from the I/O and
    /// steps through them one at a time.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let event = self.io.next_event().await?;
            let closed = matches!(event, IoEvent::Closed);
            self.step(event)?;
            if closed {
                return Ok(());
            }
        }
    }

    /// Begins shutdown: refuses new client requests, fails the pending
    /// ones with `Shutdown`, and asks the I/O to wind down. The final
    /// `Closed` event ends [`RaftServer::run`].
    pub fn close(&mut self) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        pf_info!(self.id; "closing");
        self.closing = true;
        self.fail_leader_requests(SkiffError::Shutdown);
        self.state = State::Unavailable;
        self.io.close()
    }

    /// Handler of the periodic tick, the single source of time-driven
    /// action.
    fn handle_tick(&mut self) -> Result<()> {
        if !self.started || self.closing {
            return Ok(());
        }
        let now = self.io.time();

        match self.state {
            State::Follower | State::Candidate => {
                let can_campaign = self.configuration.is_voter(self.id)
                    || self.state == State::Candidate;
                if can_campaign
                    && now.saturating_sub(self.election_timer_start)
                        >= self.randomized_election_timeout
                {
                    self.start_election(false)?;
                }
            }
            State::Leader => {
                self.check_contact_quorum(now)?;
                if self.state == State::Leader {
                    self.tick_replication(now)?;
                    self.tick_promotion(now)?;
                    self.tick_transfer(now)?;
                }
            }
            State::Unavailable => {}
        }

        self.maybe_apply()?;
        self.maybe_take_snapshot()?;
        Ok(())
    }

    /// Handler of a send completion. A failed send is recoverable: the
    /// affected follower falls back to probing and is retried on the next
    /// heartbeat.
    fn handle_sent(&mut self, to: ServerId, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            pf_trace!(self.id; "send to {} failed: {}", to, e);
            self.errmsg = format!("send to {}: {}", to, e);
            if self.state == State::Leader {
                if let Some(p) = self.progress.get_mut(to) {
                    p.to_probe();
                }
            }
        }
        Ok(())
    }

    /// Builds and submits one outgoing message. Submission failures are
    /// recoverable and degrade the peer to probing.
    pub(super) fn send_message(
        &mut self,
        to: ServerId,
        to_address: &str,
        kind: MessageKind,
    ) -> Result<()> {
        let msg = Message {
            from: self.id,
            from_address: self.address.clone(),
            kind,
        };
        if let Err(e) = self.io.send(to, to_address, msg) {
            pf_warn!(self.id; "submitting send to {} failed: {}", to, e);
            self.errmsg = format!("send to {}: {}", to, e);
            if self.state == State::Leader {
                if let Some(p) = self.progress.get_mut(to) {
                    p.to_probe();
                }
            }
        }
        Ok(())
    }

    /// Records leader contact: updates the known leader and re-arms the
    /// election timer.
    pub(super) fn heard_from_leader(
        &mut self,
        from: ServerId,
        from_address: &str,
    ) {
        self.current_leader = Some((from, from_address.to_owned()));
        self.last_leader_contact = self.io.time();
        self.reset_election_timer();
    }

    /// Makes the configuration carried by a freshly appended change entry
    /// effective immediately, before it commits.
    pub(super) fn stage_configuration(
        &mut self,
        index: Index,
        payload: &bytes::Bytes,
    ) -> Result<()> {
        let configuration = Configuration::decode(payload)
            .map_err(|e| SkiffError::Corrupt(e.to_string()))?;
        pf_info!(self.id; "configuration staged at index {}: {}",
                          index, configuration);
        self.configuration = configuration;
        self.configuration_uncommitted_index = index;
        if self.state == State::Leader {
            self.progress
                .rebuild(&self.configuration, self.log.last_index());
        }
        Ok(())
    }

    /// Promotes the staged configuration to committed once its entry's
    /// index is covered by `commit_index`, completing the change request.
    pub(super) fn commit_configuration_if_ready(&mut self) {
        if self.configuration_uncommitted_index == 0
            || self.configuration_uncommitted_index > self.commit_index
        {
            return;
        }
        self.configuration_index = self.configuration_uncommitted_index;
        self.configuration_uncommitted_index = 0;
        self.committed_configuration = self.configuration.clone();
        pf_info!(self.id; "configuration committed at index {}",
                          self.configuration_index);

        if let Some(change) = self.pending_change.take() {
            if change.index <= self.commit_index {
                let _ = change.tx.send(Ok(()));
            } else {
                self.pending_change = Some(change);
            }
        }
    }

    /// Deletes the log suffix from `index` onwards, here and on disk,
    /// rolling back an uncommitted configuration if its entry is cut.
    pub(super) fn truncate_suffix(&mut self, index: Index) -> Result<()> {
        if self.configuration_uncommitted_index >= index {
            pf_debug!(self.id; "rolling back staged configuration at {}",
                               self.configuration_uncommitted_index);
            self.configuration = self.committed_configuration.clone();
            self.configuration_uncommitted_index = 0;
        }
        self.log.truncate_from(index)?;
        self.io.truncate(index)?;
        if self.last_stored >= index {
            self.last_stored = index - 1;
        }
        Ok(())
    }

    /// My server ID.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Current engine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Latest term this server has seen.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// The current leader's ID and address, if known.
    pub fn leader(&self) -> Option<(ServerId, &str)> {
        self.current_leader
            .as_ref()
            .map(|(id, address)| (*id, address.as_str()))
    }

    /// Index of the last entry in the log.
    pub fn last_index(&self) -> Index {
        self.log.last_index()
    }

    /// Highest log index known to be committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Highest log index applied to the state machine.
    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    /// Membership configuration currently in effect.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Description of the most recent failure, empty if none occurred.
    pub fn errmsg(&self) -> &str {
        &self.errmsg
    }
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::configuration::Role;
    use crate::testing::{MemFsm, MemIo, MemIoHandle};

    fn single_server() -> (RaftServer<MemFsm, MemIo>, MemIoHandle) {
        let (io, io_handle) = MemIo::new(7);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        (server, io_handle)
    }

    #[test]
    fn new_rejects_zero_id() {
        let (io, _) = MemIo::new(1);
        let (fsm, _) = MemFsm::new();
        assert_eq!(
            RaftServer::new(0, "s0", fsm, io, None).err(),
            Some(SkiffError::BadId)
        );
    }

    #[test]
    fn new_rejects_bad_tunables() {
        let (io, _) = MemIo::new(1);
        let (fsm, _) = MemFsm::new();
        let config_str = Some("election_timeout = 50");
        assert!(RaftServer::new(1, "s1", fsm, io, config_str).is_err());

        let (io, _) = MemIo::new(1);
        let (fsm, _) = MemFsm::new();
        let config_str = Some("not_a_knob = 1");
        assert!(RaftServer::new(1, "s1", fsm, io, config_str).is_err());
    }

    #[test]
    fn tunables_overlay() {
        let (io, _) = MemIo::new(1);
        let (fsm, _) = MemFsm::new();
        let config_str =
            Some("election_timeout = 500\nsnapshot_threshold = 8");
        let server = RaftServer::new(1, "s1", fsm, io, config_str).unwrap();
        assert_eq!(server.config.election_timeout, 500);
        assert_eq!(server.config.snapshot_threshold, 8);
        assert_eq!(server.config.heartbeat_timeout, 100);
    }

    #[test]
    fn close_refuses_further_requests() {
        let (mut server, _io_handle) = single_server();
        server.start().unwrap();
        server.close().unwrap();
        assert_eq!(server.state(), State::Unavailable);
        assert_eq!(server.barrier().err(), Some(SkiffError::Shutdown));
    }
}
