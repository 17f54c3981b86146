//! Durable log append bookkeeping: tracking in-flight appends, advancing
//! `last_stored` on completion, and acking the leader once entries are
//! safely on disk.

use super::*;

use crate::log::Entry;

/// One append submitted to the I/O and not yet completed.
#[derive(Debug)]
pub(super) struct PendingAppend {
    /// Sequence number carried back by the completion event.
    pub seq: u64,

    /// First index of the appended range.
    pub first_index: Index,

    /// Last index of the appended range.
    pub last_index: Index,

    /// Term of the entry at `last_index` when submitted; a mismatch at
    /// completion time means the range was truncated away meanwhile.
    pub last_term: Term,

    /// Leader to ack after the entries are durable (follower side only).
    pub notify: Option<(ServerId, String)>,
}

// RaftServer durable append logic
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Submits the given contiguous entry range to the I/O for durable
    /// append. The entries were just placed in the in-memory log; their
    /// payload handles are shared with the request, not copied.
    pub(super) fn submit_append(
        &mut self,
        first_index: Index,
        last_index: Index,
        entries: Vec<Entry>,
        notify: Option<(ServerId, String)>,
    ) -> Result<()> {
        debug_assert_eq!(
            entries.len() as Index,
            last_index - first_index + 1
        );
        let last_term = entries.last().map(|e| e.term).unwrap_or(0);
        let seq = self.append_seq;
        self.append_seq += 1;

        if let Err(e) = self.io.append(seq, entries) {
            pf_error!(self.id; "submitting append of {} - {} failed: {}",
                               first_index, last_index, e);
            self.errmsg = format!("append: {}", e);
            if self.state == State::Leader {
                return self.become_follower(None);
            }
            return Ok(());
        }
        pf_trace!(self.id; "submitted append for {} - {}",
                           first_index, last_index);

        self.pending_appends.push_back(PendingAppend {
            seq,
            first_index,
            last_index,
            last_term,
            notify,
        });
        Ok(())
    }

    /// Handler of an append completion. Completions arrive strictly in
    /// submission order.
    pub(super) fn handle_appended(
        &mut self,
        seq: u64,
        result: Result<()>,
    ) -> Result<()> {
        let Some(pending) = self.pending_appends.pop_front() else {
            pf_warn!(self.id; "append completion {} with none pending", seq);
            return Ok(());
        };
        if pending.seq != seq {
            return logged_err!(self.id; "append completion {} != pending {}",
                                        seq, pending.seq);
        }

        if let Err(e) = result {
            pf_error!(self.id; "append of {} - {} failed: {}",
                               pending.first_index, pending.last_index, e);
            self.errmsg = format!("append: {}", e);
            if self.state == State::Leader {
                pf_warn!(self.id; "own log append failed, stepping down");
                return self.become_follower(None);
            }
            return Ok(());
        }

        // a range truncated after submission must not advance anything;
        // the replacement entries have their own append in flight
        if self.log.term_of(pending.last_index) != Some(pending.last_term) {
            pf_trace!(self.id; "stale append completion for {} - {}",
                               pending.first_index, pending.last_index);
            return Ok(());
        }

        if pending.last_index > self.last_stored {
            self.last_stored = pending.last_index;
        }
        if self.closing {
            return Ok(());
        }

        match self.state {
            State::Leader => {
                if let Some(p) = self.progress.get_mut(self.id) {
                    p.maybe_update(self.last_stored);
                }
                self.try_commit()
            }
            State::Follower => {
                if let Some((leader, address)) = pending.notify {
                    pf_trace!(self.id; "sent AppendEntriesResult -> {} up to {}",
                                       leader, self.last_stored);
                    self.send_message(
                        leader,
                        &address,
                        MessageKind::AppendEntriesResult {
                            term: self.current_term,
                            rejected: 0,
                            last_log_index: self.last_stored,
                        },
                    )?;
                }
                self.advance_follower_commit()
            }
            _ => Ok(()),
        }
    }

    /// Applies the leader's advertised commit watermark, clamped to what
    /// is durably stored locally.
    pub(super) fn advance_follower_commit(&mut self) -> Result<()> {
        let target = self
            .leader_commit_hint
            .min(self.last_stored)
            .min(self.log.last_index());
        if target > self.commit_index {
            self.commit_index = target;
            self.commit_configuration_if_ready();
            self.maybe_apply()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod durability_tests {
    use super::*;
    use crate::configuration::Role;
    use crate::log::EntryKind;
    use crate::testing::{MemFsm, MemIo, MemIoHandle};
    use bytes::Bytes;

    fn leader() -> (RaftServer<MemFsm, MemIo>, MemIoHandle) {
        let (io, io_handle) = MemIo::new(5);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();
        assert_eq!(server.state(), State::Leader);
        io_handle.take_outbox();
        (server, io_handle)
    }

    #[test]
    fn completions_advance_last_stored_in_order() {
        let (mut server, io_handle) = leader();
        server.apply(vec![Bytes::from_static(b"a")]).unwrap();
        server.apply(vec![Bytes::from_static(b"b")]).unwrap();
        assert_eq!(server.last_stored, 1);

        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }
        assert_eq!(server.last_stored, 3);
        assert!(server.pending_appends.is_empty());
        // sole voter: everything commits and applies
        assert_eq!(server.commit_index(), 3);
        assert_eq!(server.last_applied(), 3);
    }

    #[test]
    fn append_failure_steps_leader_down() {
        let (mut server, io_handle) = leader();
        io_handle.fail_next_append();
        server.apply(vec![Bytes::from_static(b"a")]).unwrap();
        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }
        assert_eq!(server.state(), State::Follower);
        assert!(server.errmsg().contains("append"));
    }

    #[test]
    fn stale_completion_after_truncation_ignored() {
        let (io, io_handle) = MemIo::new(6);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        conf.add(2, "s2", Role::Voter).unwrap();
        conf.add(3, "s3", Role::Voter).unwrap();
        let mut server = RaftServer::new(2, "s2", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();

        // leader 1 appends index 2 at term 2
        let msg = Message {
            from: 1,
            from_address: "s1".into(),
            kind: MessageKind::AppendEntries {
                term: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                leader_commit: 0,
                entries: vec![Entry::new(
                    2,
                    EntryKind::Command,
                    Bytes::from_static(b"old"),
                )],
            },
        };
        server.handle_msg_recv(msg).unwrap();

        // before the completion is stepped, leader 3 of term 3 overwrites
        let msg = Message {
            from: 3,
            from_address: "s3".into(),
            kind: MessageKind::AppendEntries {
                term: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                leader_commit: 0,
                entries: vec![Entry::new(
                    3,
                    EntryKind::Command,
                    Bytes::from_static(b"new"),
                )],
            },
        };
        server.handle_msg_recv(msg).unwrap();

        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }
        assert_eq!(server.last_stored, 2);
        assert_eq!(server.log.get(2).unwrap().term, 3);
        assert_eq!(io_handle.persisted_entries().len(), 2);
        assert_eq!(
            &io_handle.persisted_entries()[1].payload[..],
            b"new"
        );
    }
}
