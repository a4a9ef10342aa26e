// Log storage for Raft
// Defines the storage contract used by the consensus core and the in-memory
// implementation every other store builds on

use std::collections::VecDeque;

use tracing::debug;

use trellis_common::{Index, NodeId, Result, Term, TrellisError};

use super::types::{HardState, LogEntry, Snapshot};

/// Storage contract of a partition log
///
/// Indices are contiguous. Entries at or below the compaction point are gone,
/// but the term of the compaction point itself stays answerable so that
/// log-matching keeps working right after a compaction.
pub trait LogStore: Send {
    /// Persisted vote state
    fn hard_state(&self) -> HardState;

    /// Persist vote state before any message that depends on it leaves
    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// First index still present in the log
    fn first_index(&self) -> Index;

    /// Last index in the log, or the compaction point when the log is empty
    fn last_index(&self) -> Index;

    /// Term of `last_index`
    fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    /// Highest compacted index (0 when nothing was compacted)
    fn compacted_index(&self) -> Index {
        self.first_index() - 1
    }

    /// Term at `index`; `None` when the index is compacted away or beyond the end
    fn term_at(&self, index: Index) -> Option<Term>;

    fn entry(&self, index: Index) -> Option<LogEntry>;

    /// Entries in `[from, to)`, at most `max` of them
    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>>;

    /// Append entries; the first must directly follow `last_index`
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove `index` and everything after it
    fn truncate_from(&mut self, index: Index) -> Result<()>;

    /// Drop every entry at or below `upto` and retain `snapshot`
    ///
    /// `upto` may be lower than the snapshot index when compaction is held
    /// back by entries that must be retained longer.
    fn compact(&mut self, upto: Index, snapshot: Snapshot) -> Result<()>;

    /// Replace the log prefix with a snapshot received from the leader
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Latest retained snapshot
    fn snapshot(&self) -> Option<&Snapshot>;

    /// Number of live entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory log store: a `VecDeque` offset by the compaction point
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    hard_state: HardState,
    entries: VecDeque<LogEntry>,
    compacted_index: Index,
    compacted_term: Term,
    snapshot: Option<Snapshot>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate over live entries in index order
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Compaction point and its term
    pub fn compaction_point(&self) -> (Index, Term) {
        (self.compacted_index, self.compacted_term)
    }

    /// Restore a recovered state; used by persistent stores on open
    pub(crate) fn restore(
        hard_state: HardState,
        compaction_point: (Index, Term),
        snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            hard_state,
            entries: VecDeque::new(),
            compacted_index: compaction_point.0,
            compacted_term: compaction_point.1,
            snapshot,
        }
    }

    fn position(&self, index: Index) -> Option<usize> {
        if index <= self.compacted_index {
            return None;
        }
        let pos = (index - self.compacted_index - 1) as usize;
        (pos < self.entries.len()).then_some(pos)
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.hard_state = HardState { term, voted_for };
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.compacted_index + 1
    }

    fn last_index(&self) -> Index {
        self.compacted_index + self.entries.len() as Index
    }

    fn term_at(&self, index: Index) -> Option<Term> {
        if index == self.compacted_index {
            return Some(self.compacted_term);
        }
        self.position(index).map(|pos| self.entries[pos].term)
    }

    fn entry(&self, index: Index) -> Option<LogEntry> {
        self.position(index).map(|pos| self.entries[pos].clone())
    }

    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>> {
        if from <= self.compacted_index {
            return Err(TrellisError::Compacted { index: from });
        }
        let end = to.min(self.last_index() + 1);
        if from >= end {
            return Ok(Vec::new());
        }
        let start = (from - self.compacted_index - 1) as usize;
        let count = ((end - from) as usize).min(max);
        Ok(self.entries.iter().skip(start).take(count).cloned().collect())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(TrellisError::storage(format!(
                    "non-contiguous append: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            self.entries.push_back(entry.clone());
        }
        if !entries.is_empty() {
            debug!("Appended {} log entries", entries.len());
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: Index) -> Result<()> {
        if index <= self.compacted_index {
            return Err(TrellisError::storage(format!(
                "cannot truncate at {} below compaction point {}",
                index, self.compacted_index
            )));
        }
        let keep = (index - self.compacted_index - 1) as usize;
        self.entries.truncate(keep);
        debug!("Truncated logs from index {}", index);
        Ok(())
    }

    fn compact(&mut self, upto: Index, snapshot: Snapshot) -> Result<()> {
        if upto > snapshot.index() {
            return Err(TrellisError::storage(format!(
                "compaction point {} beyond snapshot index {}",
                upto,
                snapshot.index()
            )));
        }
        if upto > self.last_index() {
            return Err(TrellisError::storage(format!(
                "compaction point {} beyond last index {}",
                upto,
                self.last_index()
            )));
        }
        if upto > self.compacted_index {
            let term = self.term_at(upto).unwrap_or(0);
            let drop = (upto - self.compacted_index) as usize;
            self.entries.drain(..drop);
            self.compacted_index = upto;
            self.compacted_term = term;
            debug!("Purged logs up to index {}", upto);
        }
        let newer = self
            .snapshot
            .as_ref()
            .is_none_or(|current| current.index() < snapshot.index());
        if newer {
            self.snapshot = Some(snapshot);
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.index();
        if index <= self.compacted_index {
            return Ok(());
        }
        if self.term_at(index) == Some(snapshot.term()) {
            // The log already contains the snapshot point: keep the suffix.
            let drop = (index - self.compacted_index) as usize;
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }
        self.compacted_index = index;
        self.compacted_term = snapshot.term();
        self.snapshot = Some(snapshot);
        debug!("Installed snapshot at index {}", index);
        Ok(())
    }

    fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
