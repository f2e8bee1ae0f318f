use crate::storage::Persister;
use bytes::Bytes;
use prost::Message;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// FilePersister keeps the raft state in a small record file inside `directory`, and the
/// snapshot in a file of its own that the record names.
///
/// A save writes a new snapshot file only when the snapshot changed, then writes the record to a
/// temp file, syncs it, and renames it over the old record. A crash leaves either the old or the
/// new pair of blobs and never a mix. Snapshot files the record no longer names are removed after
/// the rename.
pub struct FilePersister {
    directory: PathBuf,
    // Serializes writers sharing the temp file, and tracks which snapshot is on disk.
    write_state: Mutex<WriteState>,
}

struct WriteState {
    snapshot_generation: u64,
    // What `snapshot_generation` holds, once known. Unknown after open until the first save.
    saved_snapshot: Option<Bytes>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoPersistedRecord {
    #[prost(bytes, tag = "1")]
    raft_state: Vec<u8>,
    /// 0 means no snapshot.
    #[prost(uint64, tag = "2")]
    snapshot_generation: u64,
}

const RECORD_FILE_NAME: &str = "raft.record";
const TEMP_FILE_NAME: &str = "raft.record.tmp";

impl FilePersister {
    /// Creates `directory` if it doesn't exist.
    pub fn open(directory: impl AsRef<Path>) -> io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let persister = FilePersister {
            directory,
            write_state: Mutex::new(WriteState {
                snapshot_generation: 0,
                saved_snapshot: None,
            }),
        };
        // A corrupt record surfaces on read. Here we only need to avoid reusing its generation.
        if let Ok(record) = persister.read_record() {
            persister.lock_write_state().snapshot_generation = record.snapshot_generation;
        }

        Ok(persister)
    }

    fn record_path(&self) -> PathBuf {
        self.directory.join(RECORD_FILE_NAME)
    }

    fn snapshot_path(&self, generation: u64) -> PathBuf {
        self.directory.join(format!("snapshot.{}", generation))
    }

    fn lock_write_state(&self) -> MutexGuard<'_, WriteState> {
        self.write_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_record(&self) -> io::Result<ProtoPersistedRecord> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(ProtoPersistedRecord::default());
        }

        let contents = fs::read(&path)?;
        ProtoPersistedRecord::decode(contents.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }
}

impl Persister for FilePersister {
    fn save(&self, raft_state: Bytes, snapshot: Bytes) -> io::Result<()> {
        let mut write_state = self.lock_write_state();
        let previous_generation = write_state.snapshot_generation;

        let unchanged = match &write_state.saved_snapshot {
            Some(saved) => saved.len() == snapshot.len() && (saved.as_ptr() == snapshot.as_ptr() || *saved == snapshot),
            None => false,
        };
        let generation = if snapshot.is_empty() {
            0
        } else if unchanged {
            previous_generation
        } else {
            let generation = previous_generation + 1;
            Self::write_synced(&self.snapshot_path(generation), &snapshot)?;
            generation
        };

        let record = ProtoPersistedRecord {
            raft_state: raft_state.to_vec(),
            snapshot_generation: generation,
        };
        let mut buf = Vec::with_capacity(record.encoded_len());
        record
            .encode(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.directory.join(TEMP_FILE_NAME);
        Self::write_synced(&temp_path, &buf)?;
        fs::rename(&temp_path, self.record_path())?;

        if previous_generation != 0 && previous_generation != generation {
            // The save already happened. A leftover file only wastes space.
            let _ = fs::remove_file(self.snapshot_path(previous_generation));
        }
        // Never hand out a generation twice, even after saving an empty snapshot.
        write_state.snapshot_generation = generation.max(previous_generation);
        write_state.saved_snapshot = Some(snapshot);

        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Bytes> {
        self.read_record().map(|record| Bytes::from(record.raft_state))
    }

    fn read_snapshot(&self) -> io::Result<Bytes> {
        let record = self.read_record()?;
        if record.snapshot_generation == 0 {
            return Ok(Bytes::new());
        }
        fs::read(self.snapshot_path(record.snapshot_generation)).map(Bytes::from)
    }
}
