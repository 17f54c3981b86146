//! Startup: bootstrapping new clusters, loading persisted state, and
//! disaster recovery.

use super::*;

use crate::configuration::Configuration;
use crate::log::{EntryKind, RaftLog};

// RaftServer startup and recovery logic
impl<S: StateMachine, I: RaftIo> RaftServer<S, I> {
    /// Persists the given configuration as the founding log entry of a
    /// brand-new cluster. Only legal on a pristine, unstarted server.
    pub fn bootstrap(&mut self, configuration: &Configuration) -> Result<()> {
        if self.started {
            return Err(SkiffError::CantBootstrap);
        }
        if configuration.is_empty() {
            return Err(SkiffError::Invalid(
                "empty bootstrap configuration".into(),
            ));
        }
        self.io.bootstrap(configuration)
    }

    /// Force-appends a new configuration to the stored log, to recover a
    /// cluster that lost quorum. Only legal before `start`.
    pub fn recover(&mut self, configuration: &Configuration) -> Result<()> {
        if self.started {
            return Err(SkiffError::Invalid(
                "recover called on a started server".into(),
            ));
        }
        if configuration.is_empty() {
            return Err(SkiffError::Invalid(
                "empty recovery configuration".into(),
            ));
        }
        pf_warn!(self.id; "force-recovering with configuration {}",
                          configuration);
        self.io.recover(configuration)
    }

    /// Loads persisted state and brings the engine online as follower,
    /// or directly as leader when it is the only voter.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SkiffError::Invalid("already started".into()));
        }

        let loaded = self.io.load()?;
        self.current_term = loaded.term;
        self.voted_for = loaded.voted_for;

        let snapshot_meta = loaded
            .snapshot
            .as_ref()
            .map(|s| (s.last_index, s.last_term));
        if let Some(snapshot) = loaded.snapshot {
            self.configuration = snapshot.configuration.clone();
            self.committed_configuration = snapshot.configuration;
            self.configuration_index = snapshot.configuration_index;
            self.commit_index = snapshot.last_index;
            self.last_applied = snapshot.last_index;
            self.leader_commit_hint = snapshot.last_index;
            self.fsm
                .restore(snapshot.data.first().cloned().unwrap_or_default())?;
        }
        self.log =
            RaftLog::load(snapshot_meta, loaded.start_index, loaded.entries)?;
        self.last_stored = self.log.last_index();

        // the most recent configuration entry in the stored log wins over
        // the snapshot's; entries loaded from disk count as committed
        for index in self.log.first_index()..=self.log.last_index() {
            let Some(entry) = self.log.get(index) else { break };
            if entry.kind == EntryKind::ConfigChange {
                let configuration = Configuration::decode(&entry.payload)
                    .map_err(|e| SkiffError::Corrupt(e.to_string()))?;
                self.configuration = configuration.clone();
                self.committed_configuration = configuration;
                self.configuration_index = index;
            }
        }

        self.io.start(self.config.heartbeat_timeout)?;
        self.started = true;
        self.state = State::Follower;
        self.reset_election_timer();
        pf_info!(self.id; "started: term {} log {} - {} configuration {}",
                          self.current_term, self.log.first_index(),
                          self.log.last_index(), self.configuration);

        // a sole voter has no one to campaign against: it elects itself
        // on the spot without burning a term
        if self.configuration.n_voters() == 1
            && self.configuration.is_voter(self.id)
        {
            pf_info!(self.id; "sole voter, electing self");
            self.state = State::Candidate;
            if self.voted_for.is_none() {
                self.voted_for = Some(self.id);
                self.io.set_vote(Some(self.id))?;
            }
            self.votes.insert(self.id, true);
            self.become_leader()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::configuration::Role;
    use crate::testing::{MemFsm, MemIo};
    use bytes::Bytes;

    fn conf_3() -> Configuration {
        let mut conf = Configuration::new();
        conf.add(1, "s1", Role::Voter).unwrap();
        conf.add(2, "s2", Role::Voter).unwrap();
        conf.add(3, "s3", Role::Voter).unwrap();
        conf
    }

    #[test]
    fn bootstrap_writes_founding_entry() {
        let (io, io_handle) = MemIo::new(31);
        let (fsm, _) = MemFsm::new();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf_3()).unwrap();
        server.start().unwrap();

        assert_eq!(server.state(), State::Follower);
        assert_eq!(server.current_term(), 1);
        assert_eq!(server.last_index(), 1);
        assert_eq!(server.configuration(), &conf_3());
        assert_eq!(io_handle.persisted_term(), 1);
    }

    #[test]
    fn bootstrap_refused_on_existing_state() {
        let (io, _) = MemIo::new(32);
        let (fsm, _) = MemFsm::new();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf_3()).unwrap();
        assert_eq!(
            server.bootstrap(&conf_3()).err(),
            Some(SkiffError::CantBootstrap)
        );

        server.start().unwrap();
        assert_eq!(
            server.bootstrap(&conf_3()).err(),
            Some(SkiffError::CantBootstrap)
        );
    }

    #[test]
    fn start_restores_snapshot_state() {
        let (io, io_handle) = MemIo::new(33);
        let (fsm, fsm_handle) = MemFsm::new();
        io_handle.seed_snapshot(crate::io::Snapshot {
            last_index: 7,
            last_term: 2,
            configuration: conf_3(),
            configuration_index: 1,
            data: vec![MemFsm::encode_state(&[Bytes::from_static(b"k")])],
        });
        io_handle.seed_term(2);

        let mut server = RaftServer::new(2, "s2", fsm, io, None).unwrap();
        server.start().unwrap();
        assert_eq!(server.last_applied(), 7);
        assert_eq!(server.commit_index(), 7);
        assert_eq!(server.last_index(), 7);
        assert_eq!(server.current_term(), 2);
        assert_eq!(fsm_handle.applied(), vec![Bytes::from_static(b"k")]);
        assert_eq!(server.configuration(), &conf_3());
    }

    #[test]
    fn recover_appends_new_configuration() {
        let (io, io_handle) = MemIo::new(34);
        let (fsm, _) = MemFsm::new();
        let mut server = RaftServer::new(1, "s1", fsm, io, None).unwrap();
        server.bootstrap(&conf_3()).unwrap();

        let mut shrunk = Configuration::new();
        shrunk.add(1, "s1", Role::Voter).unwrap();
        server.recover(&shrunk).unwrap();
        server.start().unwrap();

        // the recovery configuration is the latest config entry, and the
        // server is now its own quorum
        assert_eq!(server.configuration(), &shrunk);
        assert_eq!(server.state(), State::Leader);
        assert_eq!(io_handle.persisted_entries().len(), 2);
    }
}
