//! Peer-peer RPC message types.

use crate::configuration::Configuration;
use crate::log::Entry;
use crate::{Index, ServerId, Term};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// A single RPC message sent or received over the network. The engine
/// leaves wire framing and byte ordering to the I/O implementation; these
/// types only fix the fields each kind carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// ID of the sending server.
    pub from: ServerId,

    /// Address of the sending server.
    pub from_address: String,

    /// Kind-specific payload.
    pub kind: MessageKind,
}

/// The six RPC kinds, dispatched by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Invoked by candidates to gather votes.
    RequestVote {
        /// Candidate's term.
        term: Term,
        /// Index of candidate's last log entry.
        last_log_index: Index,
        /// Term of the entry at `last_log_index`.
        last_log_term: Term,
        /// True if an active leader may be deposed, as in a leadership
        /// transfer; false makes followers with a live leader refuse.
        disrupt_leader: bool,
    },

    /// Reply to RequestVote.
    RequestVoteResult {
        /// Receiver's current term, for the candidate to update itself.
        term: Term,
        /// True means the candidate received the vote.
        vote_granted: bool,
    },

    /// Invoked by the leader to replicate entries; empty ones double as
    /// heartbeats.
    AppendEntries {
        /// Leader's term.
        term: Term,
        /// Index of the entry preceding the new ones.
        prev_log_index: Index,
        /// Term of the entry at `prev_log_index`.
        prev_log_term: Term,
        /// Leader's commit index.
        leader_commit: Index,
        /// Entries to append.
        entries: Vec<Entry>,
    },

    /// Reply to AppendEntries (and completion ack for InstallSnapshot).
    AppendEntriesResult {
        /// Receiver's current term.
        term: Term,
        /// If non-zero, the `prev_log_index` that was rejected.
        rejected: Index,
        /// Receiver's last durable log index, as a back-off hint on
        /// rejection and as the replicated watermark on success.
        last_log_index: Index,
    },

    /// Invoked by the leader to bring a follower whose log lags behind the
    /// leader's compacted prefix back up to speed.
    InstallSnapshot {
        /// Leader's term.
        term: Term,
        /// Index of the last entry covered by the snapshot.
        last_index: Index,
        /// Term of the entry at `last_index`.
        last_term: Term,
        /// Configuration as of `last_index`.
        conf: Configuration,
        /// Index at which `conf` was committed.
        conf_index: Index,
        /// Raw snapshot content.
        data: Bytes,
    },

    /// Invoked by a leader to transfer leadership to a caught-up voter.
    TimeoutNow {
        /// Leader's term.
        term: Term,
        /// Index of the leader's last log entry.
        last_log_index: Index,
        /// Term of the entry at `last_log_index`.
        last_log_term: Term,
    },
}

impl MessageKind {
    /// Short name of the message kind, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::RequestVote { .. } => "RequestVote",
            MessageKind::RequestVoteResult { .. } => "RequestVoteResult",
            MessageKind::AppendEntries { .. } => "AppendEntries",
            MessageKind::AppendEntriesResult { .. } => "AppendEntriesResult",
            MessageKind::InstallSnapshot { .. } => "InstallSnapshot",
            MessageKind::TimeoutNow { .. } => "TimeoutNow",
        }
    }

    /// Term the sender stamped on this message.
    pub fn term(&self) -> Term {
        match self {
            MessageKind::RequestVote { term, .. }
            | MessageKind::RequestVoteResult { term, .. }
            | MessageKind::AppendEntries { term, .. }
            | MessageKind::AppendEntriesResult { term, .. }
            | MessageKind::InstallSnapshot { term, .. }
            | MessageKind::TimeoutNow { term, .. } => *term,
        }
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use crate::log::EntryKind;

    #[test]
    fn codec_round_trip() {
        let mut conf = Configuration::new();
        conf.add(1, "a", crate::configuration::Role::Voter).unwrap();

        let msgs = vec![
            Message {
                from: 1,
                from_address: "a".into(),
                kind: MessageKind::AppendEntries {
                    term: 3,
                    prev_log_index: 7,
                    prev_log_term: 2,
                    leader_commit: 6,
                    entries: vec![Entry::new(
                        3,
                        EntryKind::Command,
                        Bytes::from_static(b"cmd"),
                    )],
                },
            },
            Message {
                from: 2,
                from_address: "b".into(),
                kind: MessageKind::InstallSnapshot {
                    term: 3,
                    last_index: 10,
                    last_term: 2,
                    conf,
                    conf_index: 1,
                    data: Bytes::from_static(b"state"),
                },
            },
        ];

        for msg in msgs {
            let bytes = rmp_serde::encode::to_vec(&msg).unwrap();
            let back: Message =
                rmp_serde::decode::from_slice(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn term_extraction() {
        let kind = MessageKind::TimeoutNow {
            term: 9,
            last_log_index: 1,
            last_log_term: 1,
        };
        assert_eq!(kind.term(), 9);
        assert_eq!(kind.name(), "TimeoutNow");
    }
}
