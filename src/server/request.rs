//! Client request entrance: applies, barriers, membership changes and
//! leadership transfer, plus the pending queues completed as the commit
//! and apply indexes advance.

use super::*;

use crate::configuration::{Configuration, Role};
use crate::log::{Entry, EntryKind};

use bytes::Bytes;

use tokio::sync::oneshot;

/// An accepted apply request waiting for its entries to be applied.
pub(super) struct ApplyRequest<Out> {
    pub first_index: Index,
    pub last_index: Index,
    pub outputs: Vec<Out>,
    pub tx: oneshot::Sender<Result<Vec<Out>>>,
}

/// An accepted barrier request waiting for its entry to be applied.
pub(super) struct BarrierRequest {
    pub index: Index,
    pub tx: oneshot::Sender<Result<Index>>,
}

/// A configuration change whose entry is in the log but not committed.
pub(super) struct ChangeRequest {
    pub index: Index,
    pub tx: oneshot::Sender<Result<()>>,
}

/// A promotion to voter waiting for the promotee to catch up through
/// bounded sync rounds.
pub(super) struct PromotionRound {
    pub id: ServerId,
    pub role: Role,
    pub round_number: u64,
    pub round_index: Index,
    pub round_start: TimeMs,
    pub tx: oneshot::Sender<Result<()>>,
}

/// An in-progress leadership transfer.
pub(super) struct TransferRequest {
    pub target: ServerId,
    pub start: TimeMs,
    pub sent: bool,
    pub tx: oneshot::Sender<bool>,
}

// RaftServer client requests entrance
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Proposes command entries, one per payload buffer. The returned
    /// receiver completes with the state machine outputs once every entry
    /// has been committed and applied.
    pub fn apply(
        &mut self,
        payloads: Vec<Bytes>,
    ) -> Result<oneshot::Receiver<Result<Vec<S::Output>>>> {
        self.check_can_request()?;
        if payloads.is_empty() {
            return Err(SkiffError::Invalid("no payloads given".into()));
        }

        let first_index = self.log.last_index() + 1;
        let entries: Vec<Entry> = payloads
            .into_iter()
            .map(|payload| {
                Entry::new(self.current_term, EntryKind::Command, payload)
            })
            .collect();
        let last_index = first_index + entries.len() as Index - 1;
        for entry in &entries {
            self.log.append(entry.clone())?;
        }
        self.submit_append(first_index, last_index, entries, None)?;
        pf_debug!(self.id; "accepted apply request for {} - {}",
                           first_index, last_index);

        let (tx, rx) = oneshot::channel();
        self.apply_reqs.push_back(ApplyRequest {
            first_index,
            last_index,
            outputs: vec![],
            tx,
        });
        self.replicate_fresh()?;
        Ok(rx)
    }

    /// Proposes a barrier entry; the receiver completes with the
    /// barrier's index once every earlier command has been applied.
    pub fn barrier(&mut self) -> Result<oneshot::Receiver<Result<Index>>> {
        self.check_can_request()?;

        let index = self.log.last_index() + 1;
        let entry = Entry::new(
            self.current_term,
            EntryKind::Barrier,
            Bytes::new(),
        );
        self.log.append(entry.clone())?;
        self.submit_append(index, index, vec![entry], None)?;
        pf_debug!(self.id; "accepted barrier request at {}", index);

        let (tx, rx) = oneshot::channel();
        self.barrier_reqs.push_back(BarrierRequest { index, tx });
        self.replicate_fresh()?;
        Ok(rx)
    }

    /// Adds a new server to the cluster with the Idle role.
    pub fn add(
        &mut self,
        id: ServerId,
        address: &str,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.check_can_change()?;
        let mut configuration = self.configuration.clone();
        configuration.add(id, address, Role::Idle)?;

        let (tx, rx) = oneshot::channel();
        self.append_change(configuration, tx)?;
        Ok(rx)
    }

    /// Promotes a server to a higher role. Promotion to Voter of a server
    /// that is behind goes through bounded catch-up rounds before the
    /// change entry is appended.
    pub fn promote(
        &mut self,
        id: ServerId,
        role: Role,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.check_can_change()?;
        let current = self
            .configuration
            .get(id)
            .map(|s| s.role)
            .ok_or(SkiffError::BadId)?;
        let legal = matches!(
            (current, role),
            (Role::Idle, Role::Standby)
                | (Role::Idle, Role::Voter)
                | (Role::Standby, Role::Voter)
        );
        if !legal {
            return Err(SkiffError::BadRole);
        }

        let (tx, rx) = oneshot::channel();
        let match_index = self
            .progress
            .get(id)
            .map(|p| p.match_index)
            .unwrap_or(0);
        if role == Role::Voter && match_index < self.log.last_index() {
            // catch the promotee up before letting it count for quorum
            let now = self.io.time();
            pf_info!(self.id; "promotee {} starting catch-up to {}",
                              id, self.log.last_index());
            self.promotion = Some(PromotionRound {
                id,
                role,
                round_number: 1,
                round_index: self.log.last_index(),
                round_start: now,
                tx,
            });
            self.send_append_entries(id)?;
            return Ok(rx);
        }

        let mut configuration = self.configuration.clone();
        configuration.get_mut(id).unwrap().role = role;
        self.append_change(configuration, tx)?;
        Ok(rx)
    }

    /// Demotes a server to a lesser role.
    pub fn demote(
        &mut self,
        id: ServerId,
        role: Role,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.check_can_change()?;
        let current = self
            .configuration
            .get(id)
            .map(|s| s.role)
            .ok_or(SkiffError::BadId)?;
        let legal = matches!(
            (current, role),
            (Role::Voter, Role::Standby)
                | (Role::Voter, Role::Idle)
                | (Role::Standby, Role::Idle)
        );
        if !legal {
            return Err(SkiffError::BadRole);
        }
        if current == Role::Voter && self.configuration.n_voters() == 1 {
            return Err(SkiffError::CantChange);
        }

        let (tx, rx) = oneshot::channel();
        let mut configuration = self.configuration.clone();
        configuration.get_mut(id).unwrap().role = role;
        self.append_change(configuration, tx)?;
        Ok(rx)
    }

    /// Removes a server from the cluster configuration.
    pub fn remove(
        &mut self,
        id: ServerId,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.check_can_change()?;
        let current = self
            .configuration
            .get(id)
            .map(|s| s.role)
            .ok_or(SkiffError::BadId)?;
        if current == Role::Voter && self.configuration.n_voters() == 1 {
            return Err(SkiffError::CantChange);
        }

        let (tx, rx) = oneshot::channel();
        let mut configuration = self.configuration.clone();
        configuration.remove(id)?;
        self.append_change(configuration, tx)?;
        Ok(rx)
    }

    /// Transfers leadership to the given voter, or to the most caught-up
    /// voting follower when `id` is 0. The receiver resolves `true` once
    /// the target takes over and `false` if an election timeout passes
    /// first.
    pub fn transfer_leadership(
        &mut self,
        id: ServerId,
    ) -> Result<oneshot::Receiver<bool>> {
        if self.closing {
            return Err(SkiffError::Shutdown);
        }
        if self.state != State::Leader {
            return Err(SkiffError::NotLeader);
        }
        if self.transfer.is_some() {
            return Err(SkiffError::Busy);
        }

        let target = if id == 0 {
            self.committed_configuration
                .servers()
                .filter(|s| s.role == Role::Voter && s.id != self.id)
                .max_by_key(|s| {
                    self.progress
                        .get(s.id)
                        .map(|p| p.match_index)
                        .unwrap_or(0)
                })
                .map(|s| s.id)
                .ok_or(SkiffError::NotFound)?
        } else {
            if id == self.id || !self.committed_configuration.is_voter(id) {
                return Err(SkiffError::BadId);
            }
            id
        };

        pf_info!(self.id; "transferring leadership to {}", target);
        let (tx, rx) = oneshot::channel();
        self.transfer = Some(TransferRequest {
            target,
            start: self.io.time(),
            sent: false,
            tx,
        });
        self.maybe_send_timeout_now()?;
        Ok(rx)
    }

    /// Refuses new requests unless we are an unencumbered leader.
    fn check_can_request(&self) -> Result<()> {
        if self.closing {
            return Err(SkiffError::Shutdown);
        }
        if self.state != State::Leader || self.transfer.is_some() {
            return Err(SkiffError::NotLeader);
        }
        Ok(())
    }

    /// Additionally refuses configuration changes while one is pending.
    fn check_can_change(&self) -> Result<()> {
        self.check_can_request()?;
        if self.configuration_uncommitted_index != 0
            || self.pending_change.is_some()
            || self.promotion.is_some()
        {
            return Err(SkiffError::CantChange);
        }
        Ok(())
    }

    /// Appends a configuration change entry, staging the configuration
    /// immediately.
    fn append_change(
        &mut self,
        configuration: Configuration,
        tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let index = self.log.last_index() + 1;
        let entry = Entry::new(
            self.current_term,
            EntryKind::ConfigChange,
            configuration.encode(),
        );
        self.log.append(entry.clone())?;
        self.stage_configuration(index, &entry.payload)?;
        self.submit_append(index, index, vec![entry], None)?;
        self.pending_change = Some(ChangeRequest { index, tx });
        self.replicate_fresh()
    }

    /// Advances the promotion sync round as acks arrive: a round that met
    /// its target quickly enough (or reached the very end of the log)
    /// means the promotee is caught up and the change entry goes in.
    pub(super) fn check_promotion_progress(&mut self) -> Result<()> {
        let Some(promotion) = self.promotion.as_ref() else {
            return Ok(());
        };
        let match_index = self
            .progress
            .get(promotion.id)
            .map(|p| p.match_index)
            .unwrap_or(0);
        if match_index < promotion.round_index {
            return Ok(());
        }

        let now = self.io.time();
        let caught_up = now.saturating_sub(promotion.round_start)
            < self.config.election_timeout
            || match_index == self.log.last_index();
        if caught_up {
            let promotion = self.promotion.take().unwrap();
            pf_info!(self.id; "promotee {} caught up after {} round(s)",
                              promotion.id, promotion.round_number);
            let mut configuration = self.configuration.clone();
            match configuration.get_mut(promotion.id) {
                Some(server) => server.role = promotion.role,
                None => {
                    let _ = promotion.tx.send(Err(SkiffError::BadId));
                    return Ok(());
                }
            }
            self.append_change(configuration, promotion.tx)
        } else {
            self.bump_promotion_round(now)
        }
    }

    /// Expires a promotion round that outlived one election timeout.
    pub(super) fn tick_promotion(&mut self, now: TimeMs) -> Result<()> {
        let expired = self.promotion.as_ref().is_some_and(|p| {
            now.saturating_sub(p.round_start) >= self.config.election_timeout
        });
        if expired {
            self.bump_promotion_round(now)?;
        }
        Ok(())
    }

    /// Starts the next sync round, or fails the promotion with `Busy`
    /// once the allowed rounds are used up.
    fn bump_promotion_round(&mut self, now: TimeMs) -> Result<()> {
        let Some(promotion) = self.promotion.as_mut() else {
            return Ok(());
        };
        if promotion.round_number >= self.config.max_catch_up_rounds {
            let promotion = self.promotion.take().unwrap();
            pf_warn!(self.id; "promotee {} failed to catch up in {} rounds",
                              promotion.id, promotion.round_number);
            let _ = promotion.tx.send(Err(SkiffError::Busy));
            return Ok(());
        }
        promotion.round_number += 1;
        promotion.round_index = self.log.last_index();
        promotion.round_start = now;
        let id = promotion.id;
        self.send_append_entries(id)
    }

    /// Routes one state machine output into the apply request that owns
    /// the applied index.
    pub(super) fn deliver_apply_output(
        &mut self,
        index: Index,
        output: S::Output,
    ) {
        let Some(front) = self.apply_reqs.front_mut() else {
            return;
        };
        let expected = front.first_index + front.outputs.len() as Index;
        if index != expected {
            // an entry from an earlier leadership, no request owns it
            return;
        }
        front.outputs.push(output);
        if index == front.last_index {
            let request = self.apply_reqs.pop_front().unwrap();
            pf_debug!(self.id; "completed apply request {} - {}",
                               request.first_index, request.last_index);
            let _ = request.tx.send(Ok(request.outputs));
        }
    }

    /// Fails the apply request owning the given index.
    pub(super) fn fail_apply_at(&mut self, index: Index, err: SkiffError) {
        let owns = self.apply_reqs.front().is_some_and(|r| {
            index >= r.first_index && index <= r.last_index
        });
        if owns {
            let request = self.apply_reqs.pop_front().unwrap();
            let _ = request.tx.send(Err(err));
        }
    }

    /// Completes the barrier waiting at the given index, if any.
    pub(super) fn complete_barrier(&mut self, index: Index) {
        let matches = self
            .barrier_reqs
            .front()
            .is_some_and(|b| b.index == index);
        if matches {
            let barrier = self.barrier_reqs.pop_front().unwrap();
            pf_debug!(self.id; "completed barrier request at {}", index);
            let _ = barrier.tx.send(Ok(index));
        }
    }

    /// Fails every outstanding leader-side request, e.g. on step-down
    /// (`LeadershipLost`) or shutdown (`Shutdown`).
    pub(super) fn fail_leader_requests(&mut self, err: SkiffError) {
        for request in self.apply_reqs.drain(..) {
            let _ = request.tx.send(Err(err.clone()));
        }
        for barrier in self.barrier_reqs.drain(..) {
            let _ = barrier.tx.send(Err(err.clone()));
        }
        if let Some(change) = self.pending_change.take() {
            let _ = change.tx.send(Err(err.clone()));
        }
        if let Some(promotion) = self.promotion.take() {
            let _ = promotion.tx.send(Err(err.clone()));
        }
        if let Some(transfer) = self.transfer.take() {
            let _ = transfer.tx.send(false);
        }
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::testing::{MemFsm, MemIo, MemIoHandle};

    fn sole_leader() -> (RaftServer<MemFsm, MemIo>, MemIoHandle) {
        let (io, io_handle) = MemIo::new(13);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();
        (server, io_handle)
    }

    fn settle(
        server: &mut RaftServer<MemFsm, MemIo>,
        io_handle: &MemIoHandle,
    ) {
        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }
    }

    #[test]
    fn requests_refused_on_follower() {
        let (io, _) = MemIo::new(14);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        conf.add(2, "s2", Role::Voter).unwrap();
        let mut server = RaftServer::new(2, "s2", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();

        assert_eq!(
            server.apply(vec![Bytes::from_static(b"x")]).err(),
            Some(SkiffError::NotLeader)
        );
        assert_eq!(server.barrier().err(), Some(SkiffError::NotLeader));
        assert_eq!(
            server.add(9, "s9").err(),
            Some(SkiffError::NotLeader)
        );
    }

    #[test]
    fn change_serialization() {
        let (mut server, io_handle) = sole_leader();
        let rx4 = server.add(4, "s4").unwrap();

        // a second change while the first is uncommitted is refused
        assert_eq!(
            server.add(5, "s5").err(),
            Some(SkiffError::CantChange)
        );

        settle(&mut server, &io_handle);
        let mut rx4 = rx4;
        assert!(rx4.try_recv().unwrap().is_ok());
        assert!(server.configuration().get(4).is_some());

        // committed now, the next change is accepted
        assert!(server.add(5, "s5").is_ok());
    }

    #[test]
    fn add_duplicate_rejected() {
        let (mut server, _io_handle) = sole_leader();
        assert_eq!(
            server.add(1, "elsewhere").err(),
            Some(SkiffError::DuplicateId)
        );
        assert_eq!(server.add(4, "s1").err(), Some(SkiffError::DuplicateAddress));
    }

    #[test]
    fn promote_demote_role_matrix() {
        let (mut server, io_handle) = sole_leader();
        let rx = server.add(4, "s4").unwrap();
        settle(&mut server, &io_handle);
        drop(rx);

        // Idle -> Idle and Voter -> Voter make no sense
        assert_eq!(
            server.promote(4, Role::Idle).err(),
            Some(SkiffError::BadRole)
        );
        assert_eq!(
            server.demote(4, Role::Voter).err(),
            Some(SkiffError::BadRole)
        );
        assert_eq!(server.promote(99, Role::Voter).err(), Some(SkiffError::BadId));

        // the only voter can neither be demoted nor removed
        assert_eq!(
            server.demote(1, Role::Standby).err(),
            Some(SkiffError::CantChange)
        );
        assert_eq!(server.remove(1).err(), Some(SkiffError::CantChange));

        // Idle -> Standby is a plain change
        let rx = server.promote(4, Role::Standby).unwrap();
        settle(&mut server, &io_handle);
        let mut rx = rx;
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(
            server.configuration().get(4).unwrap().role,
            Role::Standby
        );
    }

    #[test]
    fn promotion_rounds_exhaust_to_busy() {
        let config_str = Some("max_catch_up_rounds = 2");
        let (io, io_handle) = MemIo::new(15);
        let (fsm, _) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        let mut server =
            RaftServer::new(1, "s1", fsm, io, config_str).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();

        let rx = server.add(4, "s4").unwrap();
        settle(&mut server, &io_handle);
        drop(rx);

        // grow the log so the promotee is behind
        server.apply(vec![Bytes::from_static(b"x")]).unwrap();
        settle(&mut server, &io_handle);

        let rx = server.promote(4, Role::Voter).unwrap();
        assert!(server.promotion.is_some());
        io_handle.take_outbox();

        // rounds expire without the promotee ever acking
        for _ in 0..3 {
            io_handle.advance(2 * server.config.election_timeout);
            server.step(IoEvent::Tick).unwrap();
        }
        let mut rx = rx;
        assert_eq!(rx.try_recv().unwrap().err(), Some(SkiffError::Busy));
        assert!(server.promotion.is_none());
    }

    #[test]
    fn transfer_validation() {
        let (mut server, _io_handle) = sole_leader();
        assert_eq!(
            server.transfer_leadership(1).err(),
            Some(SkiffError::BadId)
        );
        // no voting follower to auto-select
        assert_eq!(
            server.transfer_leadership(0).err(),
            Some(SkiffError::NotFound)
        );
    }
}
