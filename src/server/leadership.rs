//! Leader election, term bookkeeping, and leadership transfer.

use super::*;

/// Outcome of the generic incoming-term rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TermCheck {
    /// The message's term is older than ours; reject with our term.
    Stale,

    /// The message's term matches ours (possibly after adopting it).
    Current,
}

// RaftServer leader election and term logic
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Re-arms the election timer with a fresh randomized timeout in
    /// `[election_timeout, 2 * election_timeout)`.
    pub(super) fn reset_election_timer(&mut self) {
        let timeout = self.config.election_timeout;
        self.randomized_election_timeout =
            self.io.random(timeout, 2 * timeout);
        self.election_timer_start = self.io.time();
    }

    /// Applies the generic term rule that precedes all message-specific
    /// handling: a newer term is adopted durably and converts us to
    /// follower; an older term flags the message as stale.
    pub(super) fn check_incoming_term(
        &mut self,
        term: Term,
    ) -> Result<TermCheck> {
        if term < self.current_term {
            return Ok(TermCheck::Stale);
        }
        if term > self.current_term {
            pf_debug!(self.id; "observed newer term {} > {}",
                               term, self.current_term);
            self.current_term = term;
            self.voted_for = None;
            self.io.set_term(term)?;

            // a pending leadership transfer succeeds the moment a newer
            // term shows up
            if let Some(transfer) = self.transfer.take() {
                pf_info!(self.id; "leadership transfer to {} succeeded",
                                  transfer.target);
                let _ = transfer.tx.send(true);
            }
            self.become_follower(None)?;
        }
        Ok(TermCheck::Current)
    }

    /// Converts to follower, failing any leader-side client requests.
    pub(super) fn become_follower(
        &mut self,
        leader: Option<(ServerId, String)>,
    ) -> Result<()> {
        let was_leader = self.state == State::Leader;
        if self.state != State::Follower {
            pf_info!(self.id; "converted to follower at term {}",
                              self.current_term);
        }
        self.state = State::Follower;
        self.current_leader = leader;
        self.votes.clear();
        self.reset_election_timer();
        if was_leader {
            self.fail_leader_requests(SkiffError::LeadershipLost);
        }
        Ok(())
    }

    /// Converts to candidate and campaigns for a new term. `disrupt`
    /// propagates into the RequestVote messages so that voters with a
    /// live leader still grant (used for leadership transfer).
    pub(super) fn start_election(&mut self, disrupt: bool) -> Result<()> {
        debug_assert!(self.state != State::Leader);
        self.state = State::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        pf_info!(self.id; "starting election with term {}...",
                          self.current_term);

        // both fields durable before requesting any vote
        self.io.set_term(self.current_term)?;
        self.io.set_vote(Some(self.id))?;

        self.votes.clear();
        self.votes.insert(self.id, true);
        self.current_leader = None;
        self.reset_election_timer();

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let peers: Vec<(ServerId, String)> = self
            .configuration
            .servers()
            .filter(|s| s.role == crate::configuration::Role::Voter)
            .filter(|s| s.id != self.id)
            .map(|s| (s.id, s.address.clone()))
            .collect();
        for (peer, address) in peers {
            self.send_message(
                peer,
                &address,
                MessageKind::RequestVote {
                    term: self.current_term,
                    last_log_index,
                    last_log_term,
                    disrupt_leader: disrupt,
                },
            )?;
            pf_trace!(self.id; "sent RequestVote -> {} term {} last {} term {}",
                               peer, self.current_term, last_log_index,
                               last_log_term);
        }

        self.try_win_election()
    }

    /// Becomes leader if the granted votes reach quorum. A sole voter
    /// wins on the spot.
    pub(super) fn try_win_election(&mut self) -> Result<()> {
        if self.state != State::Candidate {
            return Ok(());
        }
        let granted = self.votes.values().filter(|g| **g).count();
        if granted >= self.configuration.quorum() {
            self.become_leader()?;
        }
        Ok(())
    }

    /// Takes over as leader: rebuilds the progress table and immediately
    /// heartbeats every member.
    pub(super) fn become_leader(&mut self) -> Result<()> {
        pf_info!(self.id; "elected to be leader with term {}",
                          self.current_term);
        self.state = State::Leader;
        self.current_leader = Some((self.id, self.address.clone()));
        self.progress =
            ProgressTable::new(&self.configuration, self.log.last_index());
        if let Some(p) = self.progress.get_mut(self.id) {
            p.maybe_update(self.last_stored);
        }

        // open a fresh contact-check window, then announce ourselves
        let now = self.io.time();
        self.election_timer_start = now;
        self.progress.reset_recent_recv();
        self.tick_replication(now)?;

        // a sole voter commits by itself
        self.try_commit()
    }

    /// Steps down if a majority of voters has not been heard from within
    /// one election timeout. Evaluated once per timeout window.
    pub(super) fn check_contact_quorum(&mut self, now: TimeMs) -> Result<()> {
        if now.saturating_sub(self.election_timer_start)
            < self.config.election_timeout
        {
            return Ok(());
        }

        let mut contacted = 0;
        for server in self.configuration.servers() {
            if server.role != crate::configuration::Role::Voter {
                continue;
            }
            if server.id == self.id
                || self
                    .progress
                    .get(server.id)
                    .is_some_and(|p| p.recent_recv)
            {
                contacted += 1;
            }
        }

        if contacted < self.configuration.quorum() {
            pf_warn!(self.id; "lost contact with quorum ({} of {}), stepping down",
                              contacted, self.configuration.quorum());
            self.become_follower(None)
        } else {
            self.election_timer_start = now;
            self.progress.reset_recent_recv();
            Ok(())
        }
    }

    /// Handler of RequestVote reply from a voter.
    pub(super) fn handle_request_vote_result(
        &mut self,
        peer: ServerId,
        term: Term,
        vote_granted: bool,
    ) -> Result<()> {
        pf_trace!(self.id; "received RequestVoteResult <- {} term {} {}",
                           peer, term,
                           if vote_granted { "granted" } else { "false" });
        if self.check_incoming_term(term)? == TermCheck::Stale
            || self.state != State::Candidate
        {
            return Ok(());
        }

        self.votes.insert(peer, vote_granted);
        self.try_win_election()
    }

    /// Handler of TimeoutNow from a leader transferring leadership to us.
    pub(super) fn handle_timeout_now(
        &mut self,
        peer: ServerId,
        term: Term,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Result<()> {
        pf_debug!(self.id; "received TimeoutNow <- {} term {}", peer, term);
        if self.check_incoming_term(term)? == TermCheck::Stale
            || self.state != State::Follower
            || !self.configuration.is_voter(self.id)
        {
            return Ok(());
        }

        // only a caught-up target may depose the current leader
        if self.log.last_index() < last_log_index
            || self.log.last_term() < last_log_term
        {
            pf_warn!(self.id; "ignoring TimeoutNow, log behind {} term {}",
                              last_log_index, last_log_term);
            return Ok(());
        }

        self.start_election(true)
    }

    /// Sends the TimeoutNow for a pending transfer once the target has
    /// fully caught up.
    pub(super) fn maybe_send_timeout_now(&mut self) -> Result<()> {
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let target = match &self.transfer {
            Some(transfer) if !transfer.sent => transfer.target,
            _ => return Ok(()),
        };
        let caught_up = self
            .progress
            .get(target)
            .is_some_and(|p| p.match_index == last_log_index);
        if !caught_up {
            return Ok(());
        }

        let Some(address) =
            self.configuration.get(target).map(|s| s.address.clone())
        else {
            return Ok(());
        };
        pf_info!(self.id; "sent TimeoutNow -> {} for term {}",
                          target, self.current_term);
        self.send_message(
            target,
            &address,
            MessageKind::TimeoutNow {
                term: self.current_term,
                last_log_index,
                last_log_term,
            },
        )?;
        if let Some(transfer) = &mut self.transfer {
            transfer.sent = true;
        }
        Ok(())
    }

    /// Expires a pending leadership transfer after one election timeout.
    pub(super) fn tick_transfer(&mut self, now: TimeMs) -> Result<()> {
        let expired = self.transfer.as_ref().is_some_and(|t| {
            now.saturating_sub(t.start) >= self.config.election_timeout
        });
        if expired {
            let transfer = self.transfer.take().unwrap();
            pf_warn!(self.id; "leadership transfer to {} timed out",
                              transfer.target);
            let _ = transfer.tx.send(false);
        } else {
            self.maybe_send_timeout_now()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod leadership_tests {
    use super::*;
    use crate::configuration::Role;
    use crate::testing::{MemFsm, MemIo, MemIoHandle};

    fn three_voter_server(
    ) -> (RaftServer<MemFsm, MemIo>, MemIoHandle) {
        let (io, io_handle) = MemIo::new(42);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        conf.add(2, "s2", Role::Voter).unwrap();
        conf.add(3, "s3", Role::Voter).unwrap();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();
        (server, io_handle)
    }

    #[test]
    fn election_timeout_starts_campaign() {
        let (mut server, io_handle) = three_voter_server();
        assert_eq!(server.state(), State::Follower);

        io_handle.advance(2 * server.config.election_timeout);
        server.step(IoEvent::Tick).unwrap();
        assert_eq!(server.state(), State::Candidate);
        assert_eq!(server.current_term(), 2);

        // RequestVote broadcast to the two other voters
        let sent = io_handle.take_outbox();
        assert_eq!(sent.len(), 2);
        for (_, msg) in &sent {
            assert!(matches!(
                msg.kind,
                MessageKind::RequestVote { term: 2, .. }
            ));
        }
    }

    #[test]
    fn votes_reach_quorum() {
        let (mut server, io_handle) = three_voter_server();
        io_handle.advance(2 * server.config.election_timeout);
        server.step(IoEvent::Tick).unwrap();
        io_handle.take_outbox();

        server
            .handle_request_vote_result(2, server.current_term(), true)
            .unwrap();
        assert_eq!(server.state(), State::Leader);
        assert_eq!(server.leader().unwrap().0, 1);

        // heartbeats announced right away
        let sent = io_handle.take_outbox();
        assert_eq!(sent.len(), 2);
        for (_, msg) in &sent {
            assert!(matches!(
                msg.kind,
                MessageKind::AppendEntries { .. }
            ));
        }
    }

    #[test]
    fn rejected_votes_do_not_elect() {
        let (mut server, io_handle) = three_voter_server();
        io_handle.advance(2 * server.config.election_timeout);
        server.step(IoEvent::Tick).unwrap();

        let term = server.current_term();
        server.handle_request_vote_result(2, term, false).unwrap();
        server.handle_request_vote_result(3, term, false).unwrap();
        assert_eq!(server.state(), State::Candidate);

        // a newer term converts the candidate back to follower
        server.handle_request_vote_result(2, term + 1, false).unwrap();
        assert_eq!(server.state(), State::Follower);
        assert_eq!(server.current_term(), term + 1);
    }

    #[test]
    fn quorum_contact_loss_steps_down() {
        let (mut server, io_handle) = three_voter_server();
        io_handle.advance(2 * server.config.election_timeout);
        server.step(IoEvent::Tick).unwrap();
        server
            .handle_request_vote_result(2, server.current_term(), true)
            .unwrap();
        assert_eq!(server.state(), State::Leader);

        // no follower contact for over an election timeout
        io_handle.advance(2 * server.config.election_timeout);
        server.step(IoEvent::Tick).unwrap();
        assert_eq!(server.state(), State::Follower);
    }
}
