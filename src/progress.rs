//! Per-peer replication progress tracking, used by leaders.

use std::collections::HashMap;

use crate::configuration::Configuration;
use crate::{Index, ServerId, TimeMs};

/// How the leader currently feeds entries to one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// At most one AppendEntries in flight per heartbeat, until the first
    /// successful ack reveals where the follower's log ends.
    Probe,

    /// Stream entries eagerly, optimistically advancing `next_index`.
    Pipeline,

    /// An InstallSnapshot is in flight; no AppendEntries until it is acked.
    Snapshot,
}

/// Replication progress of a single server.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Current replication mode.
    pub state: ReplicationState,

    /// Index of the next entry to send.
    pub next_index: Index,

    /// Highest index reported as durably replicated on the server.
    pub match_index: Index,

    /// Last index of the most recent snapshot sent, if any.
    pub snapshot_index: Index,

    /// Timestamp of the last AppendEntries or InstallSnapshot sent.
    pub last_send: TimeMs,

    /// Whether a message was received from the server within the current
    /// contact-check window.
    pub recent_recv: bool,
}

impl Progress {
    /// Fresh progress for a follower of a leader whose log ends at
    /// `last_index`.
    fn new(last_index: Index) -> Self {
        Progress {
            state: ReplicationState::Probe,
            next_index: last_index + 1,
            match_index: 0,
            snapshot_index: 0,
            last_send: 0,
            recent_recv: false,
        }
    }

    /// Records a successful replication ack up to `last_log_index`.
    /// Returns true if the match index advanced.
    pub fn maybe_update(&mut self, last_log_index: Index) -> bool {
        let advanced = last_log_index > self.match_index;
        if advanced {
            self.match_index = last_log_index;
        }
        if last_log_index + 1 > self.next_index {
            self.next_index = last_log_index + 1;
        }
        advanced
    }

    /// Backs off `next_index` after a rejected AppendEntries, using the
    /// follower's reported `last_log_index` as a hint.
    pub fn maybe_decrement(&mut self, rejected: Index, last_log_index: Index) {
        self.next_index = rejected.min(last_log_index + 1).max(1);
    }

    /// Switches back to probing, e.g. after a rejection or send failure.
    pub fn to_probe(&mut self) {
        self.state = ReplicationState::Probe;
        self.snapshot_index = 0;
    }

    /// Switches to pipelining after a successful ack.
    pub fn to_pipeline(&mut self) {
        self.state = ReplicationState::Pipeline;
        self.snapshot_index = 0;
    }

    /// Marks an InstallSnapshot up to `snapshot_index` as in flight.
    pub fn to_snapshot(&mut self, snapshot_index: Index) {
        self.state = ReplicationState::Snapshot;
        self.snapshot_index = snapshot_index;
    }
}

/// Progress of every member of the current configuration, keyed by ID.
#[derive(Debug, Clone, Default)]
pub struct ProgressTable {
    servers: HashMap<ServerId, Progress>,
}

impl ProgressTable {
    /// Builds the table a freshly elected leader starts from: every member
    /// is probed from the end of the leader's log.
    pub fn new(configuration: &Configuration, last_index: Index) -> Self {
        let mut table = ProgressTable::default();
        table.rebuild(configuration, last_index);
        table
    }

    /// Re-aligns the table with a changed configuration, keeping the known
    /// progress of surviving members and probing new ones from scratch.
    pub fn rebuild(
        &mut self,
        configuration: &Configuration,
        last_index: Index,
    ) {
        self.servers
            .retain(|id, _| configuration.get(*id).is_some());
        for server in configuration.servers() {
            self.servers
                .entry(server.id)
                .or_insert_with(|| Progress::new(last_index));
        }
    }

    pub fn get(&self, id: ServerId) -> Option<&Progress> {
        self.servers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Progress> {
        self.servers.get_mut(&id)
    }

    /// Iterates over all tracked servers.
    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &Progress)> {
        self.servers.iter()
    }

    /// Clears every member's contact flag, starting a new check window.
    pub fn reset_recent_recv(&mut self) {
        for progress in self.servers.values_mut() {
            progress.recent_recv = false;
        }
    }
}

#[cfg(test)]
mod progress_tests {
    use super::*;
    use crate::configuration::Role;

    fn table() -> ProgressTable {
        let mut c = Configuration::new();
        c.add(1, "a", Role::Voter).unwrap();
        c.add(2, "b", Role::Voter).unwrap();
        c.add(3, "c", Role::Voter).unwrap();
        ProgressTable::new(&c, 10)
    }

    #[test]
    fn initial_state() {
        let table = table();
        let p = table.get(2).unwrap();
        assert_eq!(p.state, ReplicationState::Probe);
        assert_eq!(p.next_index, 11);
        assert_eq!(p.match_index, 0);
        assert!(!p.recent_recv);
    }

    #[test]
    fn update_and_decrement() {
        let mut table = table();
        let p = table.get_mut(2).unwrap();

        assert!(p.maybe_update(7));
        assert_eq!(p.match_index, 7);
        assert_eq!(p.next_index, 11);
        assert!(!p.maybe_update(5));
        assert_eq!(p.match_index, 7);

        // rejection hint: follow the shorter of the rejected index and the
        // follower's log end, never below 1
        p.maybe_decrement(11, 4);
        assert_eq!(p.next_index, 5);
        p.maybe_decrement(3, 20);
        assert_eq!(p.next_index, 3);
        p.maybe_decrement(0, 0);
        assert_eq!(p.next_index, 1);
    }

    #[test]
    fn state_transitions() {
        let mut table = table();
        let p = table.get_mut(3).unwrap();

        p.to_pipeline();
        assert_eq!(p.state, ReplicationState::Pipeline);

        p.to_snapshot(42);
        assert_eq!(p.state, ReplicationState::Snapshot);
        assert_eq!(p.snapshot_index, 42);

        p.to_probe();
        assert_eq!(p.state, ReplicationState::Probe);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn rebuild_preserves_survivors() {
        let mut table = table();
        table.get_mut(2).unwrap().maybe_update(9);

        let mut c = Configuration::new();
        c.add(2, "b", Role::Voter).unwrap();
        c.add(4, "d", Role::Standby).unwrap();
        table.rebuild(&c, 12);

        assert!(table.get(1).is_none());
        assert!(table.get(3).is_none());
        assert_eq!(table.get(2).unwrap().match_index, 9);
        assert_eq!(table.get(4).unwrap().next_index, 13);
    }
}
