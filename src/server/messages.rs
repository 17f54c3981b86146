//! Server-side handling of incoming peer messages.

use super::*;

use crate::log::{Entry, EntryKind};

use super::leadership::TermCheck;

// RaftServer peer message handling
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Synthesized handler of an incoming peer message.
    pub(super) fn handle_msg_recv(&mut self, msg: Message) -> Result<()> {
        if !self.started || self.closing {
            return Ok(());
        }
        let Message {
            from,
            from_address,
            kind,
        } = msg;
        match kind {
            MessageKind::RequestVote {
                term,
                last_log_index,
                last_log_term,
                disrupt_leader,
            } => self.handle_request_vote(
                from,
                &from_address,
                term,
                last_log_index,
                last_log_term,
                disrupt_leader,
            ),
            MessageKind::RequestVoteResult { term, vote_granted } => {
                self.handle_request_vote_result(from, term, vote_granted)
            }
            MessageKind::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            } => self.handle_append_entries(
                from,
                from_address,
                term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            ),
            MessageKind::AppendEntriesResult {
                term,
                rejected,
                last_log_index,
            } => self.handle_append_entries_result(
                from,
                term,
                rejected,
                last_log_index,
            ),
            MessageKind::InstallSnapshot {
                term,
                last_index,
                last_term,
                conf,
                conf_index,
                data,
            } => self.handle_install_snapshot(
                from,
                from_address,
                term,
                last_index,
                last_term,
                conf,
                conf_index,
                data,
            ),
            MessageKind::TimeoutNow {
                term,
                last_log_index,
                last_log_term,
            } => self.handle_timeout_now(
                from,
                term,
                last_log_index,
                last_log_term,
            ),
        }
    }

    /// Handler of RequestVote from a candidate.
    #[allow(clippy::too_many_arguments)]
    fn handle_request_vote(
        &mut self,
        candidate: ServerId,
        candidate_address: &str,
        term: Term,
        last_log_index: Index,
        last_log_term: Term,
        disrupt_leader: bool,
    ) -> Result<()> {
        pf_trace!(self.id; "received RequestVote <- {} term {} last {} term {}",
                           candidate, term, last_log_index, last_log_term);

        // leader stickiness, checked before the term rule on purpose: a
        // candidate that was not asked to disrupt must not depose (or even
        // term-poison) a leader we are actively hearing from
        let now = self.io.time();
        if !disrupt_leader
            && self.state == State::Follower
            && self.current_leader.is_some()
            && now.saturating_sub(self.last_leader_contact)
                < self.config.election_timeout
        {
            pf_debug!(self.id; "refusing vote for {}, leader is alive",
                               candidate);
            return self.send_message(
                candidate,
                candidate_address,
                MessageKind::RequestVoteResult {
                    term: self.current_term,
                    vote_granted: false,
                },
            );
        }

        let mut vote_granted = false;
        if self.check_incoming_term(term)? == TermCheck::Current {
            let can_vote = match self.voted_for {
                None => true,
                Some(votee) => votee == candidate,
            };
            let log_ok = last_log_term > self.log.last_term()
                || (last_log_term == self.log.last_term()
                    && last_log_index >= self.log.last_index());

            if can_vote && log_ok {
                vote_granted = true;
                // durable before the reply leaves
                self.voted_for = Some(candidate);
                self.io.set_vote(Some(candidate))?;
                // don't campaign against the server we just voted for
                self.reset_election_timer();
            }
        }

        pf_trace!(self.id; "sent RequestVoteResult -> {} term {} {}",
                           candidate, self.current_term,
                           if vote_granted { "granted" } else { "false" });
        self.send_message(
            candidate,
            candidate_address,
            MessageKind::RequestVoteResult {
                term: self.current_term,
                vote_granted,
            },
        )
    }

    /// Handler of AppendEntries from a leader.
    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        leader: ServerId,
        leader_address: String,
        term: Term,
        prev_log_index: Index,
        prev_log_term: Term,
        leader_commit: Index,
        entries: Vec<Entry>,
    ) -> Result<()> {
        if !entries.is_empty() {
            pf_trace!(self.id; "received AppendEntries <- {} for {} - {} term {}",
                               leader, prev_log_index + 1,
                               prev_log_index + entries.len() as Index, term);
        }

        if self.check_incoming_term(term)? == TermCheck::Stale {
            return self.send_message(
                leader,
                &leader_address,
                MessageKind::AppendEntriesResult {
                    term: self.current_term,
                    rejected: prev_log_index.max(1),
                    last_log_index: self.last_stored,
                },
            );
        }

        // a live leader of our own term: obey it
        if self.state == State::Candidate {
            pf_info!(self.id; "discovered leader {} for term {}",
                              leader, term);
            self.become_follower(Some((leader, leader_address.clone())))?;
        } else if self.state == State::Leader {
            // two leaders of the same term cannot both have won quorum
            pf_error!(self.id; "second leader {} claims term {}", leader, term);
            return Ok(());
        }
        self.heard_from_leader(leader, &leader_address);

        // entries entirely below our snapshot are committed already
        if prev_log_index < self.log.snapshot_last_index() {
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

        // reject if our log has no matching entry at prev_log_index
        if self.log.term_of(prev_log_index) != Some(prev_log_term) {
            pf_trace!(self.id; "sent AppendEntriesResult -> {} rejecting {}",
                               leader, prev_log_index);
            return self.send_message(
                leader,
                &leader_address,
                MessageKind::AppendEntriesResult {
                    term: self.current_term,
                    rejected: prev_log_index.max(1),
                    last_log_index: self.last_stored,
                },
            );
        }

        // skip entries we already hold; a term conflict truncates our
        // suffix before the new tail goes in
        let last_new_index = prev_log_index + entries.len() as Index;
        let mut first_new = prev_log_index + 1;
        for (i, entry) in entries.iter().enumerate() {
            let index = prev_log_index + 1 + i as Index;
            match self.log.term_of(index) {
                Some(local_term) if local_term == entry.term => {
                    first_new = index + 1;
                }
                Some(_) => {
                    pf_debug!(self.id; "truncating conflicting suffix from {}",
                                       index);
                    self.truncate_suffix(index)?;
                    first_new = index;
                    break;
                }
                None => {
                    first_new = index;
                    break;
                }
            }
        }

        let to_append: Vec<Entry> = entries
            .into_iter()
            .skip((first_new - prev_log_index - 1) as usize)
            .collect();
        if to_append.is_empty() {
            // heartbeat or fully duplicate batch: ack where we stand
            self.send_message(
                leader,
                &leader_address,
                MessageKind::AppendEntriesResult {
                    term: self.current_term,
                    rejected: 0,
                    last_log_index: self.last_stored,
                },
            )?;
        } else {
            let mut index = first_new;
            for entry in &to_append {
                if entry.kind == EntryKind::ConfigChange {
                    self.stage_configuration(index, &entry.payload)?;
                }
                self.log.append(entry.clone())?;
                index += 1;
            }
            self.submit_append(
                first_new,
                last_new_index,
                to_append,
                Some((leader, leader_address)),
            )?;
        }

        // remember the leader's commit watermark; it takes effect only up
        // to what we have durably stored
        let commit_base = if last_new_index > prev_log_index {
            last_new_index
        } else {
            self.log.last_index()
        };
        let hint = leader_commit.min(commit_base);
        if hint > self.leader_commit_hint {
            self.leader_commit_hint = hint;
        }
        self.advance_follower_commit()?;
        Ok(())
    }
}
