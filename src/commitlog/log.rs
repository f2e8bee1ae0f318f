use std::fmt;

/// Index is an index of an entry in the log; i.e. a log entry's index.
///
/// Entries are indexed starting from 1. Index 0 never holds an entry, it is the position
/// "before the first entry" and is what an empty log reports as its last index.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    pub fn zero() -> Self {
        Self::new(0)
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.0 + delta)
    }

    /// Saturates at index 0.
    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.0.saturating_sub(delta))
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).map(Index::new)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. A log may have discarded a prefix of its entries
/// (compaction), in which case `first_index()` is greater than 1 and reads below it return None.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Index;

    /// Read log entry at specified index. None if the index was compacted away or is past the end.
    fn read(&self, index: Index) -> Option<&E>;

    /// Clone up to `max_entries` entries starting at `index`.
    fn read_from(&self, index: Index, max_entries: usize) -> Vec<E>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index);

    /// Discards every entry at or before `index`. Compacting past the end of the log leaves an
    /// empty log whose next index is `index + 1`.
    fn compact(&mut self, index: Index);

    /// first_index returns the index of the oldest retained entry (or next index, if empty).
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

pub trait Entry: Clone {}
