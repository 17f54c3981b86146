//! Ordered application of committed entries to the state machine.

use super::*;

use crate::log::EntryKind;

/// Max entries applied per event, so a large commit jump cannot stall the
/// event loop; the next tick picks up the remainder.
const MAX_APPLY_BATCH: usize = 64;

// RaftServer state machine execution
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Applies committed entries in order, from `last_applied + 1` up to
    /// `commit_index`, bounded to one batch per invocation.
    pub(super) fn maybe_apply(&mut self) -> Result<()> {
        let mut applied = 0;
        while self.last_applied < self.commit_index
            && applied < MAX_APPLY_BATCH
        {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.acquire(index) else {
                return logged_err!(self.id; "commit {} beyond cached log {}",
                                            self.commit_index,
                                            self.log.last_index());
            };

            match entry.kind {
                EntryKind::Command => {
                    match self.fsm.apply(&entry.payload) {
                        Ok(output) => {
                            pf_trace!(self.id; "applied command at index {}",
                                               index);
                            self.deliver_apply_output(index, output);
                        }
                        Err(e) => {
                            pf_error!(self.id; "fsm apply at {} failed: {}",
                                               index, e);
                            self.errmsg = format!("fsm apply: {}", e);
                            self.fail_apply_at(index, e);
                        }
                    }
                }
                EntryKind::Barrier => self.complete_barrier(index),
                EntryKind::ConfigChange => {
                    self.applied_configuration_change(index)?;
                }
            }

            self.last_applied = index;
            applied += 1;
        }
        Ok(())
    }

    /// Effects of an applied configuration change. The configuration
    /// itself took effect when the entry was appended; what remains is to
    /// step down if this server lost its place.
    fn applied_configuration_change(&mut self, index: Index) -> Result<()> {
        pf_debug!(self.id; "configuration change applied at index {}", index);
        if self.state == State::Leader
            && !self.configuration.is_voter(self.id)
        {
            pf_info!(self.id; "no longer a voter, stepping down");
            return self.become_follower(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod execution_tests {
    use super::*;
    use crate::configuration::Role;
    use crate::testing::{MemFsm, MemIo, MemIoHandle};
    use bytes::Bytes;

    fn sole_leader(
    ) -> (RaftServer<MemFsm, MemIo>, MemIoHandle, crate::testing::MemFsmHandle)
    {
        let (io, io_handle) = MemIo::new(9);
        let (fsm, fsm_handle) = MemFsm::new();
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf).unwrap();
        server.start().unwrap();
        (server, io_handle, fsm_handle)
    }

    #[test]
    fn commands_applied_in_order_exactly_once() {
        let (mut server, io_handle, fsm_handle) = sole_leader();
        let rx1 = server.apply(vec![Bytes::from_static(b"a")]).unwrap();
        let rx2 = server
            .apply(vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")])
            .unwrap();
        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }

        assert_eq!(fsm_handle.applied(), vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]);
        // re-stepping ticks must not re-apply anything
        server.step(IoEvent::Tick).unwrap();
        assert_eq!(fsm_handle.applied().len(), 3);

        let (mut rx1, mut rx2) = (rx1, rx2);
        assert_eq!(rx1.try_recv().unwrap().unwrap().len(), 1);
        assert_eq!(rx2.try_recv().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn barrier_completes_after_all_prior_commands() {
        let (mut server, io_handle, fsm_handle) = sole_leader();
        server.apply(vec![Bytes::from_static(b"a")]).unwrap();
        let rx = server.barrier().unwrap();
        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }

        let mut rx = rx;
        let barrier_index = rx.try_recv().unwrap().unwrap();
        assert_eq!(barrier_index, 3);
        assert_eq!(fsm_handle.applied().len(), 1);
        assert_eq!(server.last_applied(), 3);
    }

    #[test]
    fn fsm_error_fails_the_request() {
        let (mut server, io_handle, fsm_handle) = sole_leader();
        fsm_handle.fail_next_apply();
        let rx = server.apply(vec![Bytes::from_static(b"a")]).unwrap();
        for event in io_handle.take_events() {
            server.step(event).unwrap();
        }

        let mut rx = rx;
        assert!(rx.try_recv().unwrap().is_err());
        assert!(!server.errmsg().is_empty());
        // the engine keeps going
        assert_eq!(server.last_applied(), 2);
    }
}
