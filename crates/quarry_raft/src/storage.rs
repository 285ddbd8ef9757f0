//! Storage contract between the consensus core and the application.
//!
//! Each group is backed by one `GroupStorage`. The read half feeds the
//! consensus core; the write half is driven by the runtime's write task,
//! which persists hard state, snapshots, and entries before any message
//! that promises them leaves the node.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{ConfState, Entry, HardState, Snapshot};
use crate::RaftError;

/// Per-group durable storage.
///
/// `entries` and `term` report `RaftError::Unavailable` for indices that
/// were compacted away or never written; everything else is a hard
/// storage failure.
pub trait GroupStorage: Send + Sync {
    /// Persisted hard state and membership, with defaults for groups that
    /// have never voted. An initialized group starts from the fixed
    /// initial log position; an uninitialized one starts at zero so that
    /// it will request a snapshot.
    fn initial_state(&self) -> Result<(HardState, ConfState), RaftError>;

    /// Contiguous entries in `[lo, hi)`. When `max_bytes > 0`, stops once
    /// the accumulated encoded size exceeds it, but always returns at
    /// least one entry when `lo < hi`.
    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, RaftError>;

    /// Term of entry `i`. Answers from truncated-state metadata when `i`
    /// is the compaction boundary.
    fn term(&self, i: u64) -> Result<u64, RaftError>;

    /// `truncated_state.index + 1`.
    fn first_index(&self) -> Result<u64, RaftError>;

    fn last_index(&self) -> Result<u64, RaftError>;

    /// Point-in-time snapshot of the state machine with metadata at the
    /// applied index.
    fn snapshot(&self) -> Result<Snapshot, RaftError>;

    /// Append entries, overwriting any divergent tail, in one atomic
    /// engine batch.
    fn append(&self, entries: &[Entry]) -> Result<(), RaftError>;

    /// Replace the state machine with the snapshot contents. The existing
    /// hard state is preserved verbatim; it may record a vote that must
    /// not be rescinded.
    fn apply_snapshot(&self, snap: &Snapshot) -> Result<(), RaftError>;

    /// Persist hard state synchronously.
    fn set_hard_state(&self, hs: &HardState) -> Result<(), RaftError>;
}

/// In-memory `GroupStorage` used by runtime tests.
pub struct MemGroupStorage {
    inner: Mutex<MemStorageInner>,
}

struct MemStorageInner {
    hard_state: Option<HardState>,
    conf_state: ConfState,
    truncated_index: u64,
    truncated_term: u64,
    entries: HashMap<u64, Entry>,
    last_index: u64,
    applied_data: Vec<u8>,
}

/// Initial log position for a group created with a known membership. The
/// offset leaves room below for entries that conceptually predate the
/// group.
pub const INITIAL_LOG_INDEX: u64 = 10;
/// Term paired with `INITIAL_LOG_INDEX`.
pub const INITIAL_LOG_TERM: u64 = 5;

impl MemGroupStorage {
    /// Storage for a group whose membership is already known.
    pub fn initialized(voters: Vec<u64>) -> Self {
        Self {
            inner: Mutex::new(MemStorageInner {
                hard_state: None,
                conf_state: ConfState { voters },
                truncated_index: INITIAL_LOG_INDEX,
                truncated_term: INITIAL_LOG_TERM,
                entries: HashMap::new(),
                last_index: INITIAL_LOG_INDEX,
                applied_data: Vec::new(),
            }),
        }
    }

    /// Storage for a group waiting for a snapshot.
    pub fn uninitialized() -> Self {
        Self {
            inner: Mutex::new(MemStorageInner {
                hard_state: None,
                conf_state: ConfState::default(),
                truncated_index: 0,
                truncated_term: 0,
                entries: HashMap::new(),
                last_index: 0,
                applied_data: Vec::new(),
            }),
        }
    }

    pub fn hard_state(&self) -> Option<HardState> {
        self.inner.lock().expect("mem storage lock").hard_state
    }

    pub fn applied_data(&self) -> Vec<u8> {
        self.inner
            .lock()
            .expect("mem storage lock")
            .applied_data
            .clone()
    }
}

impl GroupStorage for MemGroupStorage {
    fn initial_state(&self) -> Result<(HardState, ConfState), RaftError> {
        let inner = self.inner.lock().expect("mem storage lock");
        let hs = match inner.hard_state {
            Some(hs) => hs,
            None if inner.truncated_index == INITIAL_LOG_INDEX => HardState {
                term: INITIAL_LOG_TERM,
                vote: 0,
                commit: INITIAL_LOG_INDEX,
            },
            None => HardState::default(),
        };
        Ok((hs, inner.conf_state.clone()))
    }

    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>, RaftError> {
        let inner = self.inner.lock().expect("mem storage lock");
        let mut out = Vec::new();
        let mut size = 0u64;
        for i in lo..hi {
            let Some(ent) = inner.entries.get(&i) else {
                return Err(RaftError::Unavailable);
            };
            size += ent.encoded_len();
            out.push(ent.clone());
            if max_bytes > 0 && size > max_bytes {
                break;
            }
        }
        if out.len() != (hi - lo) as usize && (max_bytes == 0 || size < max_bytes) {
            return Err(RaftError::Unavailable);
        }
        Ok(out)
    }

    fn term(&self, i: u64) -> Result<u64, RaftError> {
        let inner = self.inner.lock().expect("mem storage lock");
        if i == inner.truncated_index {
            return Ok(inner.truncated_term);
        }
        inner
            .entries
            .get(&i)
            .map(|e| e.term)
            .ok_or(RaftError::Unavailable)
    }

    fn first_index(&self) -> Result<u64, RaftError> {
        Ok(self.inner.lock().expect("mem storage lock").truncated_index + 1)
    }

    fn last_index(&self) -> Result<u64, RaftError> {
        Ok(self.inner.lock().expect("mem storage lock").last_index)
    }

    fn snapshot(&self) -> Result<Snapshot, RaftError> {
        let inner = self.inner.lock().expect("mem storage lock");
        Ok(Snapshot {
            data: inner.applied_data.clone(),
            metadata: crate::types::SnapshotMetadata {
                index: inner.truncated_index,
                term: inner.truncated_term,
                conf_state: inner.conf_state.clone(),
            },
        })
    }

    fn append(&self, entries: &[Entry]) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("mem storage lock");
        for ent in entries {
            inner.entries.insert(ent.index, ent.clone());
        }
        let last = entries[entries.len() - 1].index;
        let prev_last = inner.last_index;
        for i in last + 1..=prev_last {
            inner.entries.remove(&i);
        }
        inner.last_index = last;
        Ok(())
    }

    fn apply_snapshot(&self, snap: &Snapshot) -> Result<(), RaftError> {
        let mut inner = self.inner.lock().expect("mem storage lock");
        inner.entries.clear();
        inner.truncated_index = snap.metadata.index;
        inner.truncated_term = snap.metadata.term;
        inner.last_index = snap.metadata.index;
        inner.conf_state = snap.metadata.conf_state.clone();
        inner.applied_data = snap.data.clone();
        Ok(())
    }

    fn set_hard_state(&self, hs: &HardState) -> Result<(), RaftError> {
        self.inner.lock().expect("mem storage lock").hard_state = Some(*hs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(index, term, EntryKind::Normal, vec![0; 8])
    }

    #[test]
    fn initialized_storage_reports_initial_position() {
        let s = MemGroupStorage::initialized(vec![1]);
        let (hs, cs) = s.initial_state().expect("initial state");
        assert_eq!(hs.term, INITIAL_LOG_TERM);
        assert_eq!(hs.commit, INITIAL_LOG_INDEX);
        assert_eq!(cs.voters, vec![1]);
        assert_eq!(s.first_index().expect("first"), INITIAL_LOG_INDEX + 1);
        assert_eq!(s.last_index().expect("last"), INITIAL_LOG_INDEX);
    }

    #[test]
    fn entries_detects_gaps_and_respects_max_bytes() {
        let s = MemGroupStorage::initialized(vec![1]);
        s.append(&[entry(11, 5), entry(12, 5), entry(13, 6)])
            .expect("append");

        assert_eq!(s.entries(11, 11, 0).expect("empty range").len(), 0);
        assert_eq!(s.entries(11, 14, 0).expect("full range").len(), 3);
        // A max_bytes smaller than one entry still yields the first entry.
        let first = s.entries(11, 14, 1).expect("limited");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].index, 11);
        assert!(matches!(s.entries(9, 12, 0), Err(RaftError::Unavailable)));
        assert!(matches!(s.entries(12, 15, 0), Err(RaftError::Unavailable)));
    }

    #[test]
    fn term_answers_at_truncation_boundary() {
        let s = MemGroupStorage::initialized(vec![1]);
        assert_eq!(s.term(INITIAL_LOG_INDEX).expect("term"), INITIAL_LOG_TERM);
        assert!(matches!(s.term(9), Err(RaftError::Unavailable)));
    }

    #[test]
    fn append_truncates_divergent_tail() {
        let s = MemGroupStorage::initialized(vec![1]);
        s.append(&[entry(11, 5), entry(12, 5), entry(13, 5)])
            .expect("append");
        s.append(&[entry(12, 6)]).expect("overwrite");
        assert_eq!(s.last_index().expect("last"), 12);
        assert!(matches!(s.entries(13, 14, 0), Err(RaftError::Unavailable)));
        assert_eq!(s.term(12).expect("term"), 6);
    }
}
