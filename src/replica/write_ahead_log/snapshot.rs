use crate::commitlog::Index;
use crate::replica::Term;
use bytes::Bytes;

/// The application's state as of `last_included_index`, plus the term of that entry. Every log
/// entry at or before `last_included_index` is covered by it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) data: Bytes,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        Snapshot {
            last_included_index: Index::zero(),
            last_included_term: Term::new(0),
            data: Bytes::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.last_included_index.is_zero()
    }

    pub(crate) fn last_included(&self) -> (Term, Index) {
        (self.last_included_term, self.last_included_index)
    }
}
