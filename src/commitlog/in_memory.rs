use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;

// Durability is provided by the replica serializing the whole log through its persister, so
// this only has to model indexing and compaction.
pub struct InMemoryLog<E: Entry> {
    log: VecDeque<E>,
    // Index of `log[0]`.
    offset: Index,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        Self::starting_at(Index::start_index())
    }

    /// A log whose first appended entry will land at `first_index`. Used when restoring a log
    /// whose prefix lives in a snapshot.
    pub fn starting_at(first_index: Index) -> Self {
        InMemoryLog {
            log: VecDeque::new(),
            offset: first_index,
        }
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.offset {
            None
        } else {
            Some((index.as_u64() - self.offset.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Index {
        self.log.push_back(entry);

        self.offset.plus(self.log.len() as u64 - 1)
    }

    fn read(&self, index: Index) -> Option<&E> {
        self.vec_index(index).and_then(|i| self.log.get(i))
    }

    fn read_from(&self, index: Index, max_entries: usize) -> Vec<E> {
        match self.vec_index(index) {
            None => Vec::new(),
            Some(start) => self.log.iter().skip(start).take(max_entries).cloned().collect(),
        }
    }

    fn truncate(&mut self, index: Index) {
        match self.vec_index(index) {
            Some(i) => self.log.truncate(i),
            None => self.log.clear(),
        }
    }

    fn compact(&mut self, index: Index) {
        let new_offset = index.plus(1);
        if new_offset <= self.offset {
            return;
        }

        if new_offset >= self.next_index() {
            self.log.clear();
        } else {
            let num_to_drop = (new_offset.as_u64() - self.offset.as_u64()) as usize;
            self.log.drain(..num_to_drop);
        }
        self.offset = new_offset;
    }

    fn first_index(&self) -> Index {
        self.offset
    }

    fn next_index(&self) -> Index {
        self.offset.plus(self.log.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Entry for u32 {}

    fn log_with(values: &[u32]) -> InMemoryLog<u32> {
        let mut log = InMemoryLog::create();
        for v in values {
            log.append(*v);
        }
        log
    }

    #[test]
    fn append_and_read() {
        let mut log = InMemoryLog::create();
        assert_eq!(log.next_index(), Index::new(1));
        assert_eq!(log.append(10u32), Index::new(1));
        assert_eq!(log.append(20u32), Index::new(2));

        assert_eq!(log.read(Index::new(0)), None);
        assert_eq!(log.read(Index::new(1)), Some(&10));
        assert_eq!(log.read(Index::new(2)), Some(&20));
        assert_eq!(log.read(Index::new(3)), None);
        assert_eq!(log.read_from(Index::new(2), 10), vec![20]);
    }

    #[test]
    fn truncate_removes_suffix() {
        let mut log = log_with(&[1, 2, 3, 4]);
        log.truncate(Index::new(3));

        assert_eq!(log.next_index(), Index::new(3));
        assert_eq!(log.read(Index::new(3)), None);
        assert_eq!(log.append(30), Index::new(3));
    }

    #[test]
    fn compact_keeps_suffix_and_indexes() {
        let mut log = log_with(&[1, 2, 3, 4, 5]);
        log.compact(Index::new(3));

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)), None);
        assert_eq!(log.read(Index::new(4)), Some(&4));
        assert_eq!(log.read_from(Index::new(1), 10), Vec::<u32>::new());
        assert_eq!(log.read_from(Index::new(4), 1), vec![4]);

        // Compacting backwards is a no-op.
        log.compact(Index::new(2));
        assert_eq!(log.first_index(), Index::new(4));
    }

    #[test]
    fn compact_past_end_empties_log() {
        let mut log = log_with(&[1, 2]);
        log.compact(Index::new(7));

        assert_eq!(log.first_index(), Index::new(8));
        assert_eq!(log.next_index(), Index::new(8));
        assert_eq!(log.append(9), Index::new(8));
    }

    #[test]
    fn truncate_below_offset_clears() {
        let mut log = log_with(&[1, 2, 3]);
        log.compact(Index::new(1));
        log.truncate(Index::new(1));

        assert_eq!(log.next_index(), Index::new(2));
    }
}
