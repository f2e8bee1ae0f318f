//! Durable home for a replica's raft state blob and its latest snapshot.
mod file;
mod memory;

use bytes::Bytes;
use std::io;

pub use file::FilePersister;
pub use memory::MemoryPersister;

/// Persister stores two opaque blobs: the encoded raft state and the latest snapshot.
///
/// `save` must replace both blobs atomically and be durable when it returns. A replica calls
/// it before replying to any request whose reply depends on the saved state.
///
/// Every save carries the whole raft state, log suffix included, and the current snapshot. The
/// snapshot is usually the same `Bytes` as last time, so an implementation that writes to disk
/// should skip rewriting it when it hasn't changed, as `FilePersister` does.
pub trait Persister: Send + Sync {
    fn save(&self, raft_state: Bytes, snapshot: Bytes) -> io::Result<()>;

    /// Empty if nothing was ever saved.
    fn read_raft_state(&self) -> io::Result<Bytes>;

    /// Empty if nothing was ever saved.
    fn read_snapshot(&self) -> io::Result<Bytes>;

    fn raft_state_size(&self) -> io::Result<usize> {
        self.read_raft_state().map(|state| state.len())
    }
}
