//! Snapshot coordination: threshold-triggered snapshot taking, shipping
//! snapshots to lagging followers, and installing received ones.

use super::*;

use crate::configuration::Configuration;
use crate::io::Snapshot;

use bytes::Bytes;

use super::leadership::TermCheck;

/// The snapshot write currently in flight.
#[derive(Debug)]
pub(super) enum PendingSnapshot {
    /// A snapshot of our own state machine being persisted.
    Taking(Snapshot),

    /// A snapshot received from the leader being persisted before it is
    /// restored into the state machine.
    Installing {
        from: ServerId,
        from_address: String,
        snapshot: Snapshot,
    },
}

// RaftServer snapshot coordination logic
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Takes a new snapshot once enough entries were applied since the
    /// last one. At most one snapshot write is in flight at a time.
    pub(super) fn maybe_take_snapshot(&mut self) -> Result<()> {
        if self.closing
            || self.pending_snapshot.is_some()
            || self.last_applied == 0
        {
            return Ok(());
        }
        if self.last_applied - self.log.snapshot_last_index()
            < self.config.snapshot_threshold
        {
            return Ok(());
        }

        let Some(last_term) = self.log.term_of(self.last_applied) else {
            return logged_err!(self.id; "no term for applied index {}",
                                        self.last_applied);
        };
        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(e) => {
                pf_warn!(self.id; "fsm snapshot failed: {}", e);
                self.errmsg = format!("fsm snapshot: {}", e);
                return Ok(());
            }
        };

        pf_debug!(self.id; "taking snapshot up to {} term {}",
                           self.last_applied, last_term);
        let snapshot = Snapshot {
            last_index: self.last_applied,
            last_term,
            configuration: self.committed_configuration.clone(),
            configuration_index: self.configuration_index,
            data,
        };
        self.pending_snapshot = Some(PendingSnapshot::Taking(snapshot.clone()));
        if let Err(e) = self
            .io
            .snapshot_put(self.config.snapshot_trailing, snapshot)
        {
            pf_warn!(self.id; "submitting snapshot put failed: {}", e);
            self.errmsg = format!("snapshot put: {}", e);
            self.pending_snapshot = None;
        }
        Ok(())
    }

    /// Handler of a snapshot write completion, for both taken and
    /// installed snapshots.
    pub(super) fn handle_snapshot_stored(
        &mut self,
        result: Result<()>,
    ) -> Result<()> {
        match self.pending_snapshot.take() {
            None => {
                pf_warn!(self.id; "snapshot store completion with none pending");
                Ok(())
            }
            Some(PendingSnapshot::Taking(snapshot)) => {
                match result {
                    Ok(()) => {
                        self.log.compact(
                            snapshot.last_index,
                            snapshot.last_term,
                            self.config.snapshot_trailing,
                        );
                        pf_info!(self.id; "took snapshot up to {}, log starts at {}",
                                          snapshot.last_index,
                                          self.log.first_index());
                    }
                    Err(e) => {
                        // transient; the threshold will trigger a retry
                        pf_warn!(self.id; "snapshot put failed: {}", e);
                        self.errmsg = format!("snapshot put: {}", e);
                    }
                }
                Ok(())
            }
            Some(PendingSnapshot::Installing {
                from,
                from_address,
                snapshot,
            }) => match result {
                Ok(()) => self.finish_snapshot_install(
                    from,
                    from_address,
                    snapshot,
                ),
                Err(e) => {
                    pf_warn!(self.id; "persisting received snapshot failed: {}",
                                      e);
                    self.errmsg = format!("snapshot put: {}", e);
                    // report the failure; the leader retries from its
                    // current next_index
                    self.send_message(
                        from,
                        &from_address,
                        MessageKind::AppendEntriesResult {
                            term: self.current_term,
                            rejected: snapshot.last_index,
                            last_log_index: self.last_stored,
                        },
                    )
                }
            },
        }
    }

    /// Completes the installation of a persisted snapshot: resets the
    /// log, adopts the snapshot's configuration, restores the state
    /// machine and acks the leader.
    fn finish_snapshot_install(
        &mut self,
        from: ServerId,
        from_address: String,
        snapshot: Snapshot,
    ) -> Result<()> {
        let data = snapshot.flat_data();
        self.log.install(snapshot.last_index, snapshot.last_term);
        self.configuration = snapshot.configuration.clone();
        self.committed_configuration = snapshot.configuration;
        self.configuration_index = snapshot.configuration_index;
        self.configuration_uncommitted_index = 0;
        self.fsm.restore(data)?;

        self.last_stored = snapshot.last_index;
        self.commit_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
        if self.leader_commit_hint < snapshot.last_index {
            self.leader_commit_hint = snapshot.last_index;
        }
        pf_info!(self.id; "installed snapshot up to {} term {}",
                          snapshot.last_index, snapshot.last_term);

        self.send_message(
            from,
            &from_address,
            MessageKind::AppendEntriesResult {
                term: self.current_term,
                rejected: 0,
                last_log_index: self.last_stored,
            },
        )
    }

    /// Handler of InstallSnapshot from the leader.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_install_snapshot(
        &mut self,
        leader: ServerId,
        leader_address: String,
        term: Term,
        last_index: Index,
        last_term: Term,
        conf: Configuration,
        conf_index: Index,
        data: Bytes,
    ) -> Result<()> {
        pf_debug!(self.id; "received InstallSnapshot <- {} up to {} term {}",
                           leader, last_index, term);
        if self.check_incoming_term(term)? == TermCheck::Stale {
            return self.send_message(
                leader,
                &leader_address,
                MessageKind::AppendEntriesResult {
                    term: self.current_term,
                    rejected: last_index,
                    last_log_index: self.last_stored,
                },
            );
        }
        if self.state == State::Candidate {
            self.become_follower(Some((leader, leader_address.clone())))?;
        }
        self.heard_from_leader(leader, &leader_address);

        if last_index <= self.commit_index {
            // stale snapshot, we are already past it
            return self.send_message(
                leader,
                &leader_address,
                MessageKind::AppendEntriesResult {
                    term: self.current_term,
                    rejected: 0,
                    last_log_index: self.last_stored,
                },
            );
        }
        if self.pending_snapshot.is_some() {
            pf_warn!(self.id; "dropping InstallSnapshot, a snapshot is in flight");
            return Ok(());
        }

        let snapshot = Snapshot {
            last_index,
            last_term,
            configuration: conf,
            configuration_index: conf_index,
            data: vec![data],
        };
        self.pending_snapshot = Some(PendingSnapshot::Installing {
            from: leader,
            from_address: leader_address,
            snapshot: snapshot.clone(),
        });
        // trailing 0: the snapshot replaces the entire stored log
        if let Err(e) = self.io.snapshot_put(0, snapshot) {
            pf_warn!(self.id; "submitting snapshot put failed: {}", e);
            self.errmsg = format!("snapshot put: {}", e);
            self.pending_snapshot = None;
        }
        Ok(())
    }

    /// Queues the given follower for an InstallSnapshot and starts a
    /// snapshot read if none is in flight.
    pub(super) fn request_snapshot_for(
        &mut self,
        peer: ServerId,
    ) -> Result<()> {
        if !self.snapshot_waiters.contains(&peer) {
            self.snapshot_waiters.push(peer);
        }
        if !self.snapshot_get_inflight {
            self.snapshot_get_inflight = true;
            if let Err(e) = self.io.snapshot_get() {
                pf_warn!(self.id; "submitting snapshot get failed: {}", e);
                self.errmsg = format!("snapshot get: {}", e);
                self.snapshot_get_inflight = false;
            }
        }
        Ok(())
    }

    /// Handler of a snapshot read completion: ships the snapshot to every
    /// follower that was waiting for it.
    pub(super) fn handle_snapshot_loaded(
        &mut self,
        result: Result<Snapshot>,
    ) -> Result<()> {
        self.snapshot_get_inflight = false;
        let waiters = std::mem::take(&mut self.snapshot_waiters);

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                pf_warn!(self.id; "snapshot get failed: {}", e);
                self.errmsg = format!("snapshot get: {}", e);
                if self.state == State::Leader {
                    for peer in waiters {
                        if let Some(p) = self.progress.get_mut(peer) {
                            p.to_probe();
                        }
                    }
                }
                return Ok(());
            }
        };
        if self.state != State::Leader || self.closing {
            return Ok(());
        }

        let data = snapshot.flat_data();
        for peer in waiters {
            let waiting = self
                .progress
                .get(peer)
                .is_some_and(|p| {
                    p.state == crate::progress::ReplicationState::Snapshot
                });
            if !waiting {
                continue;
            }
            let Some(address) =
                self.configuration.get(peer).map(|s| s.address.clone())
            else {
                continue;
            };
            pf_info!(self.id; "sent InstallSnapshot -> {} up to {}",
                              peer, snapshot.last_index);
            self.send_message(
                peer,
                &address,
                MessageKind::InstallSnapshot {
                    term: self.current_term,
                    last_index: snapshot.last_index,
                    last_term: snapshot.last_term,
                    conf: snapshot.configuration.clone(),
                    conf_index: snapshot.configuration_index,
                    data: data.clone(),
                },
            )?;
            if let Some(p) = self.progress.get_mut(peer) {
                p.to_snapshot(snapshot.last_index);
                p.last_send = self.io.time();
            }
        }
        Ok(())
    }
}
