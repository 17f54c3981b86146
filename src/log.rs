//! In-memory cache of the persistent raft log.
//!
//! The cache is a ring of entries plus an `offset` such that the first
//! cached entry has index `offset + 1`, and metadata about the most recent
//! snapshot. Entry payloads are cheap reference-counted buffer handles:
//! many entries loaded from a single I/O buffer hold slices of one shared
//! allocation, which is released only when the last of them is dropped.
//! Handing a payload to an in-flight append or send therefore just clones
//! the handle.

use std::collections::VecDeque;

use crate::utils::{Result, SkiffError};
use crate::{Index, Term};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Log entry types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum EntryKind {
    /// Command for the application state machine.
    Command,

    /// Wait for all previous commands to be applied.
    Barrier,

    /// Cluster configuration change.
    ConfigChange,
}

/// A single entry in the raft log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Term in which the entry was created.
    pub term: Term,

    /// Entry type.
    pub kind: EntryKind,

    /// Entry payload; a handle possibly sharing a batch allocation.
    pub payload: Bytes,
}

impl Entry {
    /// Creates a new entry owning the given payload handle.
    pub fn new(term: Term, kind: EntryKind, payload: Bytes) -> Self {
        Entry {
            term,
            kind,
            payload,
        }
    }

    /// Slices one batch buffer into entries sharing its allocation. Each
    /// `(term, kind, len)` descriptor consumes `len` payload bytes off the
    /// front of the batch.
    pub fn split_batch(
        batch: Bytes,
        descriptors: &[(Term, EntryKind, usize)],
    ) -> Result<Vec<Entry>> {
        let total: usize = descriptors.iter().map(|(_, _, len)| len).sum();
        if total > batch.len() {
            return Err(SkiffError::Malformed(format!(
                "batch of {} bytes holds only part of {} entry bytes",
                batch.len(),
                total
            )));
        }

        let mut entries = Vec::with_capacity(descriptors.len());
        let mut at = 0;
        for &(term, kind, len) in descriptors {
            entries.push(Entry::new(term, kind, batch.slice(at..at + len)));
            at += len;
        }
        Ok(entries)
    }
}

/// In-memory cache of the persisted raft log.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    /// Ring of cached entries; the entry at ring position 0 has raft index
    /// `offset + 1`.
    entries: VecDeque<Entry>,

    /// Index of the entry preceding the first cached one.
    offset: Index,

    /// Index of the last entry covered by the most recent snapshot, or 0.
    snapshot_last_index: Index,

    /// Term of the entry at `snapshot_last_index`, or 0.
    snapshot_last_term: Term,
}

impl RaftLog {
    /// Creates an empty log with no snapshot.
    pub fn new() -> Self {
        RaftLog::default()
    }

    /// Initializes the cache from loaded persistent state: the snapshot
    /// metadata (if any), the index of the first loaded entry, and the
    /// loaded entries themselves.
    pub fn load(
        snapshot: Option<(Index, Term)>,
        start_index: Index,
        entries: Vec<Entry>,
    ) -> Result<Self> {
        let (snapshot_last_index, snapshot_last_term) =
            snapshot.unwrap_or((0, 0));
        if start_index == 0 {
            return Err(SkiffError::Corrupt(
                "loaded start index must be positive".into(),
            ));
        }
        if entries.is_empty() && start_index != snapshot_last_index + 1 {
            return Err(SkiffError::Corrupt(format!(
                "empty log starts at {} but snapshot ends at {}",
                start_index, snapshot_last_index
            )));
        }

        Ok(RaftLog {
            entries: entries.into(),
            offset: start_index - 1,
            snapshot_last_index,
            snapshot_last_term,
        })
    }

    /// Index of the first cached entry, `last_index + 1` if none cached.
    pub fn first_index(&self) -> Index {
        self.offset + 1
    }

    /// Index of the last entry, whether cached or only in the snapshot.
    pub fn last_index(&self) -> Index {
        self.offset + self.entries.len() as Index
    }

    /// Term of the last entry, falling back to the snapshot's.
    pub fn last_term(&self) -> Term {
        match self.entries.back() {
            Some(entry) => entry.term,
            None => self.snapshot_last_term,
        }
    }

    /// Number of entries currently cached.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Index of the last entry covered by the most recent snapshot.
    pub fn snapshot_last_index(&self) -> Index {
        self.snapshot_last_index
    }

    /// Term of the last entry covered by the most recent snapshot.
    pub fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// Borrows the entry at the given index, if cached.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index <= self.offset || index > self.last_index() {
            None
        } else {
            self.entries.get((index - self.offset - 1) as usize)
        }
    }

    /// Acquires an owning handle on the entry at the given index. The clone
    /// shares the payload buffer; dropping it is the release.
    pub fn acquire(&self, index: Index) -> Option<Entry> {
        self.get(index).cloned()
    }

    /// Term of the entry at the given index. Index 0 and the snapshot's
    /// last index resolve even though no entry is cached there.
    pub fn term_of(&self, index: Index) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_last_index {
            Some(self.snapshot_last_term)
        } else {
            self.get(index).map(|entry| entry.term)
        }
    }

    /// Acquires up to `max` entries starting at `start`, for shipping in an
    /// AppendEntries request.
    pub fn acquire_range(&self, start: Index, max: usize) -> Vec<Entry> {
        let mut acquired = Vec::new();
        let mut index = start;
        while acquired.len() < max {
            match self.acquire(index) {
                Some(entry) => acquired.push(entry),
                None => break,
            }
            index += 1;
        }
        acquired
    }

    /// Appends one entry at the tail. Terms along the log must never
    /// decrease.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        if entry.term < self.last_term() {
            return Err(SkiffError::Invalid(format!(
                "appending term {} after term {}",
                entry.term,
                self.last_term()
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Deletes the suffix of the log starting at the given index,
    /// releasing the log's reference on each removed entry. Truncating past
    /// the end is a no-op; truncating into the compacted prefix is refused.
    pub fn truncate_from(&mut self, index: Index) -> Result<()> {
        if index <= self.snapshot_last_index {
            return Err(SkiffError::Invalid(format!(
                "truncating at {} within snapshot up to {}",
                index, self.snapshot_last_index
            )));
        }
        if index <= self.offset {
            return Err(SkiffError::Invalid(format!(
                "truncating at {} before first cached entry {}",
                index,
                self.first_index()
            )));
        }
        if index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate((index - self.offset - 1) as usize);
        Ok(())
    }

    /// Replaces the whole log with a snapshot: every cached entry is
    /// released and subsequent appends start at `last_index + 1`.
    pub fn install(&mut self, last_index: Index, last_term: Term) {
        self.entries.clear();
        self.offset = last_index;
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
    }

    /// Records a freshly persisted snapshot and drops the entries older
    /// than `last_index - trailing`, keeping a tail of already-snapshotted
    /// entries around for follower catch-up.
    pub fn compact(
        &mut self,
        last_index: Index,
        last_term: Term,
        trailing: u64,
    ) {
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;

        let cut = last_index.saturating_sub(trailing);
        while self.offset < cut {
            if self.entries.pop_front().is_none() {
                // snapshot covers entries the cache never held
                self.offset = cut;
                return;
            }
            self.offset += 1;
        }
    }
}

#[cfg(test)]
mod log_tests {
    use super::*;

    fn entry(term: Term) -> Entry {
        Entry::new(term, EntryKind::Command, Bytes::from_static(b"payload"))
    }

    fn log_with(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for &term in terms {
            log.append(entry(term)).unwrap();
        }
        log
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_of(0), Some(0));
        assert_eq!(log.term_of(1), None);
        assert!(log.get(1).is_none());
    }

    #[test]
    fn index_one_append() {
        let mut log = RaftLog::new();
        log.append(entry(1)).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.term_of(1), Some(1));
        assert_eq!(log.get(1).unwrap().term, 1);
    }

    #[test]
    fn append_rejects_term_regression() {
        let mut log = log_with(&[1, 2]);
        assert!(log.append(entry(1)).is_err());
        assert_eq!(log.last_index(), 2);
        assert!(log.append(entry(2)).is_ok());
    }

    #[test]
    fn truncate_suffix() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.truncate_from(3).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert!(log.get(3).is_none());
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let mut log = log_with(&[1, 1]);
        log.truncate_from(3).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.num_entries(), 2);
    }

    #[test]
    fn truncate_into_snapshot_refused() {
        let mut log = log_with(&[1, 1, 1]);
        log.compact(2, 1, 0);
        assert!(log.truncate_from(2).is_err());
        assert!(log.truncate_from(3).is_ok());
    }

    #[test]
    fn empty_log_with_snapshot() {
        let log = RaftLog::load(Some((8, 3)), 9, vec![]).unwrap();
        assert_eq!(log.last_index(), 8);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.term_of(8), Some(3));
        assert_eq!(log.term_of(7), None);
        assert_eq!(log.first_index(), 9);
    }

    #[test]
    fn load_rejects_gap_after_snapshot() {
        assert!(RaftLog::load(Some((8, 3)), 11, vec![]).is_err());
        assert!(RaftLog::load(None, 0, vec![]).is_err());
    }

    #[test]
    fn install_discards_everything() {
        let mut log = log_with(&[1, 1, 2]);
        log.install(10, 4);
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert_eq!(log.first_index(), 11);
        log.append(entry(5)).unwrap();
        assert_eq!(log.last_index(), 11);
    }

    #[test]
    fn compact_keeps_trailing_entries() {
        let mut log = log_with(&[1, 1, 1, 2, 2, 2]);
        log.compact(5, 2, 2);
        assert_eq!(log.snapshot_last_index(), 5);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.get(4).unwrap().term, 2);
        assert!(log.get(3).is_none());

        // trailing == 0 discards everything up to the snapshot index
        log.compact(6, 2, 0);
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.first_index(), 7);
    }

    #[test]
    fn batch_entries_share_one_allocation() {
        let batch = Bytes::from(vec![b'x'; 12]);
        let base = batch.as_ptr();
        let entries = Entry::split_batch(
            batch,
            &[
                (1, EntryKind::Command, 4),
                (1, EntryKind::Command, 4),
                (1, EntryKind::Barrier, 0),
                (2, EntryKind::Command, 4),
            ],
        )
        .unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].payload.as_ptr(), base);
        assert_eq!(entries[1].payload.as_ptr(), unsafe { base.add(4) });
        assert_eq!(entries[3].payload.as_ptr(), unsafe { base.add(8) });
    }

    #[test]
    fn batch_shorter_than_descriptors_rejected() {
        let batch = Bytes::from(vec![0u8; 3]);
        assert!(
            Entry::split_batch(batch, &[(1, EntryKind::Command, 4)]).is_err()
        );
    }

    #[test]
    fn acquire_outlives_truncation() {
        let mut log = log_with(&[1, 1]);
        let held = log.acquire(2).unwrap();
        log.truncate_from(2).unwrap();
        assert_eq!(log.get(2), None);
        // the acquired handle still owns the payload
        assert_eq!(&held.payload[..], b"payload");
    }
}
