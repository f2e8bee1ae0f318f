use crate::storage::Persister;
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// MemoryPersister keeps both blobs in memory. Clones share the same storage, so a replica can
/// be restarted against a clone and find what its predecessor saved.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    blobs: Arc<Mutex<Blobs>>,
}

#[derive(Clone, Default)]
struct Blobs {
    raft_state: Bytes,
    snapshot: Bytes,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy. Writes to the copy are not visible to `self` and vice versa, which keeps a
    /// killed replica from clobbering the storage its replacement restarted from.
    pub fn copy(&self) -> Self {
        let blobs = self.lock().clone();
        MemoryPersister {
            blobs: Arc::new(Mutex::new(blobs)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Blobs> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Persister for MemoryPersister {
    fn save(&self, raft_state: Bytes, snapshot: Bytes) -> io::Result<()> {
        let mut blobs = self.lock();
        blobs.raft_state = raft_state;
        blobs.snapshot = snapshot;
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Bytes> {
        Ok(self.lock().raft_state.clone())
    }

    fn read_snapshot(&self) -> io::Result<Bytes> {
        Ok(self.lock().snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_and_copies_dont() {
        let persister = MemoryPersister::new();
        let shared = persister.clone();
        persister
            .save(Bytes::from_static(b"state-1"), Bytes::from_static(b"snap-1"))
            .unwrap();

        let copied = persister.copy();
        shared
            .save(Bytes::from_static(b"state-2"), Bytes::from_static(b"snap-2"))
            .unwrap();

        assert_eq!(persister.read_raft_state().unwrap(), Bytes::from_static(b"state-2"));
        assert_eq!(persister.read_snapshot().unwrap(), Bytes::from_static(b"snap-2"));
        assert_eq!(copied.read_raft_state().unwrap(), Bytes::from_static(b"state-1"));
        assert_eq!(copied.raft_state_size().unwrap(), 7);
    }

    #[test]
    fn empty_before_first_save() {
        let persister = MemoryPersister::new();
        assert!(persister.read_raft_state().unwrap().is_empty());
        assert!(persister.read_snapshot().unwrap().is_empty());
    }
}
