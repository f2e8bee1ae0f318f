use crate::commitlog;
use crate::replica::Term;
use bytes::Bytes;

/// A log entry as the replica stores it. Its index is its position in the log; it is encoded
/// for storage by the replica's persistence codec along with the rest of the log.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub data: Bytes,
}

impl commitlog::Entry for WriteAheadLogEntry {}
