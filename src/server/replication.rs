//! Leader-side replication: entry send selection, heartbeats, ack
//! handling and commit advancement.

use super::*;

use crate::configuration::Role;
use crate::progress::ReplicationState;

use super::leadership::TermCheck;

// RaftServer leader replication logic
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Members that receive replication traffic from us: everyone whose
    /// role replicates the log, plus a promotee catching up.
    fn replication_targets(&self) -> Vec<ServerId> {
        self.configuration
            .servers()
            .filter(|s| s.id != self.id)
            .filter(|s| {
                s.role.replicates()
                    || self.promotion.as_ref().is_some_and(|p| p.id == s.id)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Per-tick replication duty: every member whose heartbeat interval
    /// elapsed gets an AppendEntries, empty if it is fully caught up.
    pub(super) fn tick_replication(&mut self, now: TimeMs) -> Result<()> {
        for peer in self.replication_targets() {
            // a snapshot transfer that was never acked gets retried
            let stalled = self.progress.get(peer).is_some_and(|p| {
                p.state == ReplicationState::Snapshot
                    && now.saturating_sub(p.last_send)
                        >= self.config.election_timeout
            });
            if stalled {
                pf_warn!(self.id; "snapshot transfer to {} stalled, retrying",
                                  peer);
                if let Some(p) = self.progress.get_mut(peer) {
                    p.to_probe();
                }
            }

            let due = self.progress.get(peer).is_some_and(|p| {
                now.saturating_sub(p.last_send)
                    >= self.config.heartbeat_timeout
            });
            if due {
                self.send_append_entries(peer)?;
            }
        }
        Ok(())
    }

    /// Pushes freshly appended entries to every pipelining member right
    /// away; probing members pick them up on their next heartbeat.
    pub(super) fn replicate_fresh(&mut self) -> Result<()> {
        for peer in self.replication_targets() {
            let eager = self.progress.get(peer).is_some_and(|p| {
                p.state == ReplicationState::Pipeline
                    && p.next_index <= self.log.last_index()
            });
            if eager {
                self.send_append_entries(peer)?;
            }
        }
        Ok(())
    }

    /// Produces one AppendEntries for the member: a single entry while
    /// probing, a bounded window while pipelining, or detects that the
    /// member needs a snapshot because its next entry was compacted away.
    pub(super) fn send_append_entries(
        &mut self,
        peer: ServerId,
    ) -> Result<()> {
        let now = self.io.time();
        let Some(address) =
            self.configuration.get(peer).map(|s| s.address.clone())
        else {
            return Ok(());
        };
        let Some(progress) = self.progress.get(peer) else {
            return Ok(());
        };
        if progress.state == ReplicationState::Snapshot {
            return Ok(());
        }
        let next_index = progress.next_index;
        let probing = progress.state == ReplicationState::Probe;

        if next_index <= self.log.snapshot_last_index() {
            // the entry before next_index is gone; ship a snapshot
            let snapshot_index = self.log.snapshot_last_index();
            pf_debug!(self.id; "follower {} needs snapshot up to {}",
                               peer, snapshot_index);
            if let Some(p) = self.progress.get_mut(peer) {
                p.to_snapshot(snapshot_index);
                p.last_send = now;
            }
            return self.request_snapshot_for(peer);
        }

        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.log.term_of(prev_log_index) else {
            return logged_err!(self.id; "no term for prev index {}",
                                        prev_log_index);
        };
        let max = if probing {
            1
        } else {
            self.config.max_append_entries as usize
        };
        let entries = self.log.acquire_range(next_index, max);
        let n = entries.len() as Index;
        if n > 0 {
            pf_trace!(self.id; "sent AppendEntries -> {} with {} - {}",
                               peer, next_index, next_index + n - 1);
        }
        self.send_message(
            peer,
            &address,
            MessageKind::AppendEntries {
                term: self.current_term,
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit_index,
                entries,
            },
        )?;

        if let Some(p) = self.progress.get_mut(peer) {
            p.last_send = now;
            if !probing {
                // optimistic while pipelining; rejection resets it
                p.next_index += n;
            }
        }
        Ok(())
    }

    /// Handler of AppendEntriesResult from a member, which also serves as
    /// the completion ack of an InstallSnapshot.
    pub(super) fn handle_append_entries_result(
        &mut self,
        peer: ServerId,
        term: Term,
        rejected: Index,
        last_log_index: Index,
    ) -> Result<()> {
        pf_trace!(self.id; "received AppendEntriesResult <- {} term {} last {} {}",
                           peer, term, last_log_index,
                           if rejected == 0 { "ok" } else { "fail" });
        if self.check_incoming_term(term)? == TermCheck::Stale
            || self.state != State::Leader
        {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(peer) else {
            return Ok(());
        };
        progress.recent_recv = true;

        if rejected != 0 {
            if progress.state == ReplicationState::Snapshot {
                pf_warn!(self.id; "snapshot install on {} failed", peer);
            }
            progress.to_probe();
            progress.maybe_decrement(rejected, last_log_index);
            return self.send_append_entries(peer);
        }

        let stream_more;
        {
            let progress = self.progress.get_mut(peer).unwrap();
            match progress.state {
                ReplicationState::Snapshot => {
                    if last_log_index < progress.snapshot_index {
                        // stray ack from before the snapshot went out
                        return Ok(());
                    }
                    pf_debug!(self.id; "snapshot on {} installed up to {}",
                                       peer, last_log_index);
                    progress.maybe_update(last_log_index);
                    progress.to_probe();
                }
                ReplicationState::Probe => {
                    progress.maybe_update(last_log_index);
                    progress.to_pipeline();
                }
                ReplicationState::Pipeline => {
                    progress.maybe_update(last_log_index);
                }
            }
            stream_more = progress.state == ReplicationState::Pipeline
                && progress.next_index <= self.log.last_index();
        }

        self.maybe_send_timeout_now()?;
        self.check_promotion_progress()?;
        self.try_commit()?;
        if stream_more {
            self.send_append_entries(peer)?;
        }
        Ok(())
    }

    /// Advances `commit_index` to the highest index replicated on a
    /// quorum of voters whose entry carries the current term, then
    /// completes whatever that unblocks.
    pub(super) fn try_commit(&mut self) -> Result<()> {
        if self.state != State::Leader {
            return Ok(());
        }

        let mut new_commit = self.commit_index;
        let quorum = self.configuration.quorum();
        for index in (self.commit_index + 1)..=self.log.last_index() {
            // only entries of our own term may establish commitment
            if self.log.term_of(index) != Some(self.current_term) {
                continue;
            }
            let mut count = 0;
            for server in self.configuration.servers() {
                if server.role != Role::Voter {
                    continue;
                }
                let match_index = if server.id == self.id {
                    self.last_stored
                } else {
                    self.progress
                        .get(server.id)
                        .map(|p| p.match_index)
                        .unwrap_or(0)
                };
                if match_index >= index {
                    count += 1;
                }
            }
            if count >= quorum {
                new_commit = index;
            } else {
                break;
            }
        }

        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            pf_debug!(self.id; "commit index advanced to {}", new_commit);
            self.commit_configuration_if_ready();
            self.maybe_apply()?;
        }
        Ok(())
    }
}
