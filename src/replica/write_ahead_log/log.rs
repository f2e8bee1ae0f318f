use crate::api::ApplyMsg;
use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::write_ahead_log::{Snapshot, WriteAheadLogEntry};
use crate::replica::Term;
use std::cmp;

// Upper bound on entries copied out per apply batch, to keep the replica lock short.
const MAX_APPLY_BATCH_SIZE: usize = 64;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - saved locally, not yet replicated to majority
/// 2. Committed - saved locally, replicated to majority
/// 3. Applied - a committed entry that has also been handed to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries at or before the snapshot's `last_included_index` are gone from `log`; the snapshot
/// stands in for them.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    snapshot: Snapshot,
    // Set when `snapshot` hasn't been handed to the state machine yet.
    snapshot_pending_apply: bool,

    // Index of highest log entry known to be committed.
    commit_index: Index,
    // Index of highest log entry (or snapshot) delivered to the state machine.
    last_applied: Index,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// `log` must start right after `snapshot.last_included_index`. A non-empty snapshot is
    /// considered committed and will be the first thing handed to the state machine.
    pub(crate) fn new(logger: slog::Logger, log: L, snapshot: Snapshot) -> Self {
        debug_assert_eq!(log.first_index(), snapshot.last_included_index.plus(1));

        WriteAheadLog {
            logger,
            log,
            commit_index: snapshot.last_included_index,
            last_applied: Index::zero(),
            snapshot_pending_apply: !snapshot.is_empty(),
            snapshot,
        }
    }

    /// (term, index) of the last entry, falling back to the snapshot boundary. (0, 0) if both
    /// are empty.
    pub(crate) fn latest_entry(&self) -> (Term, Index) {
        let last_index = self.last_index();
        match self.log.read(last_index) {
            Some(entry) => (entry.term, last_index),
            None => self.snapshot.last_included(),
        }
    }

    pub(crate) fn last_index(&self) -> Index {
        self.log.next_index().minus(1)
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Term of the entry at `index`. The snapshot boundary itself has a known term; anything
    /// before it doesn't.
    pub(crate) fn term_at(&self, index: Index) -> Option<Term> {
        if index == self.snapshot.last_included_index {
            return Some(self.snapshot.last_included_term);
        }

        self.log.read(index).map(|entry| entry.term)
    }

    pub(crate) fn entries_from(&self, index: Index, max_entries: usize) -> Vec<WriteAheadLogEntry> {
        self.log.read_from(index, max_entries)
    }

    /// Every retained entry, oldest first.
    pub(crate) fn retained_entries(&self) -> Vec<WriteAheadLogEntry> {
        self.log.read_from(self.log.first_index(), usize::MAX)
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Index {
        self.log.append(entry)
    }

    /// Remove anything starting at `index` and later. Committed entries are never removed, in
    /// which case this returns false.
    pub(crate) fn truncate(&mut self, index: Index) -> bool {
        if index <= self.commit_index {
            slog::crit!(
                self.logger,
                "Refusing to truncate log at {:?}, entries through {:?} are committed",
                index,
                self.commit_index
            );
            return false;
        }

        self.log.truncate(index);
        true
    }

    /// The first index holding `term` in the run of `term` entries that ends at `index`.
    pub(crate) fn first_index_of_term(&self, term: Term, index: Index) -> Index {
        let first_retained = self.log.first_index();
        let mut first = index;
        while first > first_retained {
            let previous = first.minus(1);
            if self.term_at(previous) != Some(term) {
                break;
            }
            first = previous;
        }

        first
    }

    /// The last index holding `term`, if the retained log has any.
    pub(crate) fn last_index_of_term(&self, term: Term) -> Option<Index> {
        let mut index = self.last_index();
        loop {
            match self.term_at(index) {
                Some(t) if t == term => return Some(index),
                // Terms never decrease along the log.
                Some(t) if t > term && index > self.snapshot.last_included_index => index = index.minus(1),
                _ => return None,
            }
        }
    }

    pub(crate) fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> Index {
        self.last_applied
    }

    /// Leader path. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> bool {
        if tentative_new_commit_index <= self.commit_index {
            return false;
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        match self.term_at(tentative_new_commit_index) {
            Some(term) if term == current_term => {
                self.commit_index = tentative_new_commit_index;
                true
            }
            _ => false,
        }
    }

    /// Follower path. Moves the commit index forward, never past our own last entry. Returns
    /// true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        let new_commit_index = cmp::min(new_commit_index, self.last_index());
        if new_commit_index <= self.commit_index {
            return false;
        }

        self.commit_index = new_commit_index;
        true
    }

    /// Replace the log prefix through `index` with `data`. Only committed entries can be
    /// compacted. Returns true if anything changed.
    pub(crate) fn compact(&mut self, index: Index, data: bytes::Bytes) -> bool {
        if index <= self.snapshot.last_included_index || index > self.commit_index {
            slog::warn!(
                self.logger,
                "Ignoring snapshot at {:?}. Snapshot index: {:?}, commit index: {:?}",
                index,
                self.snapshot.last_included_index,
                self.commit_index
            );
            return false;
        }

        let term = match self.term_at(index) {
            Some(term) => term,
            None => {
                slog::error!(self.logger, "Missing log entry {:?} while compacting", index);
                return false;
            }
        };

        self.log.compact(index);
        self.snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        };

        true
    }

    /// Adopt a snapshot sent by the leader. Returns false if it is stale; that is, if it doesn't
    /// cover anything we haven't already committed.
    pub(crate) fn install_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.last_included_index <= self.snapshot.last_included_index
            || snapshot.last_included_index <= self.commit_index
        {
            return false;
        }

        // Keep the suffix if it continues from the snapshot, otherwise it can't be trusted.
        let (term, index) = snapshot.last_included();
        if self.term_at(index) != Some(term) {
            self.log.truncate(self.log.first_index());
        }
        self.log.compact(index);

        self.commit_index = index;
        self.snapshot = snapshot;
        self.snapshot_pending_apply = true;

        true
    }

    /// Copies out the next run of messages for the state machine, or None if it is caught up.
    /// The returned index must be passed to `mark_applied()` once they're delivered.
    pub(crate) fn take_apply_batch(&mut self) -> Option<(Vec<ApplyMsg>, Index)> {
        if self.snapshot_pending_apply {
            self.snapshot_pending_apply = false;
            let msg = ApplyMsg::Snapshot {
                index: self.snapshot.last_included_index,
                term: self.snapshot.last_included_term,
                data: self.snapshot.data.clone(),
            };
            return Some((vec![msg], self.snapshot.last_included_index));
        }

        if self.last_applied >= self.commit_index {
            return None;
        }

        let mut next_index = self.last_applied.plus(1);
        if next_index <= self.snapshot.last_included_index {
            // Only possible if the state machine snapshotted past what we told it about.
            slog::warn!(
                self.logger,
                "Skipping apply of {:?} through {:?}, covered by snapshot",
                next_index,
                self.snapshot.last_included_index
            );
            next_index = self.snapshot.last_included_index.plus(1);
        }

        let num_to_apply = (self.commit_index.as_u64() + 1).saturating_sub(next_index.as_u64()) as usize;
        let msgs: Vec<_> = self
            .log
            .read_from(next_index, cmp::min(num_to_apply, MAX_APPLY_BATCH_SIZE))
            .into_iter()
            .enumerate()
            .map(|(i, entry)| ApplyMsg::Command {
                index: next_index.plus(i as u64),
                term: entry.term,
                command: entry.data,
            })
            .collect();
        if msgs.is_empty() {
            return None;
        }

        let last = next_index.plus(msgs.len() as u64 - 1);
        Some((msgs, last))
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }
}
