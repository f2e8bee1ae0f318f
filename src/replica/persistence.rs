use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use bytes::Bytes;
use prost::Message;
use std::io;

/// Bump when the layout of `ProtoPersistentState` changes incompatibly.
const PERSISTENT_STATE_FORMAT_VERSION: u32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoPersistentState {
    #[prost(uint32, tag = "1")]
    format_version: u32,
    #[prost(uint64, tag = "2")]
    current_term: u64,
    #[prost(uint64, optional, tag = "3")]
    voted_for: Option<u64>,
    #[prost(uint64, tag = "4")]
    last_included_index: u64,
    #[prost(uint64, tag = "5")]
    last_included_term: u64,
    #[prost(message, repeated, tag = "6")]
    entries: Vec<ProtoLogEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    term: u64,
    #[prost(bytes, tag = "2")]
    data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage IO failure: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode raft state: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("Failed to decode raft state: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Unsupported raft state format version {0}")]
    UnsupportedFormatVersion(u32),
    #[error("Persisted vote for replica {voted_for} but cluster has {cluster_size} replicas")]
    VotedForOutOfRange { voted_for: u64, cluster_size: usize },
}

/// What a replica needs to persist: its term and vote, the snapshot boundary, and every log
/// entry after that boundary, in order.
pub(crate) struct PersistentStateRef<'a> {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) last_included: (Term, Index),
    pub(crate) entries: &'a [WriteAheadLogEntry],
}

#[derive(Debug)]
pub(crate) struct RestoredState {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) last_included: (Term, Index),
    pub(crate) entries: Vec<WriteAheadLogEntry>,
}

pub(crate) fn encode(state: PersistentStateRef<'_>) -> Result<Bytes, PersistenceError> {
    let (last_included_term, last_included_index) = state.last_included;
    let proto = ProtoPersistentState {
        format_version: PERSISTENT_STATE_FORMAT_VERSION,
        current_term: state.current_term.as_u64(),
        voted_for: state.voted_for.map(|id| id.as_usize() as u64),
        last_included_index: last_included_index.as_u64(),
        last_included_term: last_included_term.as_u64(),
        entries: state
            .entries
            .iter()
            .map(|entry| ProtoLogEntry {
                term: entry.term.as_u64(),
                data: entry.data.to_vec(),
            })
            .collect(),
    };

    let mut buf = Vec::with_capacity(proto.encoded_len());
    proto.encode(&mut buf)?;

    Ok(Bytes::from(buf))
}

/// Returns None if nothing was ever persisted.
pub(crate) fn decode(bytes: &[u8], cluster_size: usize) -> Result<Option<RestoredState>, PersistenceError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let proto = ProtoPersistentState::decode(bytes)?;
    if proto.format_version != PERSISTENT_STATE_FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedFormatVersion(proto.format_version));
    }

    let voted_for = match proto.voted_for {
        None => None,
        Some(v) if (v as usize) < cluster_size => Some(ReplicaId::new(v as usize)),
        Some(v) => {
            return Err(PersistenceError::VotedForOutOfRange {
                voted_for: v,
                cluster_size,
            })
        }
    };

    Ok(Some(RestoredState {
        current_term: Term::new(proto.current_term),
        voted_for,
        last_included: (Term::new(proto.last_included_term), Index::new(proto.last_included_index)),
        entries: proto
            .entries
            .into_iter()
            .map(|entry| WriteAheadLogEntry {
                term: Term::new(entry.term),
                data: Bytes::from(entry.data),
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, data: &'static [u8]) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn restores_what_was_saved() {
        let entries = vec![entry(2, b"x"), entry(3, b""), entry(3, b"yz")];
        let bytes = encode(PersistentStateRef {
            current_term: Term::new(4),
            voted_for: Some(ReplicaId::new(1)),
            last_included: (Term::new(2), Index::new(5)),
            entries: &entries,
        })
        .unwrap();

        let restored = decode(&bytes, 3).unwrap().unwrap();
        assert_eq!(restored.current_term, Term::new(4));
        assert_eq!(restored.voted_for, Some(ReplicaId::new(1)));
        assert_eq!(restored.last_included, (Term::new(2), Index::new(5)));
        assert_eq!(restored.entries.len(), 3);
        assert_eq!(restored.entries[2].term, Term::new(3));
        assert_eq!(restored.entries[2].data, Bytes::from_static(b"yz"));
    }

    #[test]
    fn no_vote_is_not_replica_zero() {
        let bytes = encode(PersistentStateRef {
            current_term: Term::new(1),
            voted_for: None,
            last_included: (Term::new(0), Index::zero()),
            entries: &[],
        })
        .unwrap();

        let restored = decode(&bytes, 3).unwrap().unwrap();
        assert_eq!(restored.voted_for, None);
    }

    #[test]
    fn empty_means_fresh_start() {
        assert!(decode(&[], 3).unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        assert!(matches!(decode(&[0xff, 0xff], 3), Err(PersistenceError::Decode(_))));

        let wrong_version = ProtoPersistentState {
            format_version: 99,
            ..ProtoPersistentState::default()
        };
        let mut buf = Vec::new();
        wrong_version.encode(&mut buf).unwrap();
        assert!(matches!(
            decode(&buf, 3),
            Err(PersistenceError::UnsupportedFormatVersion(99))
        ));

        let bad_vote = ProtoPersistentState {
            format_version: PERSISTENT_STATE_FORMAT_VERSION,
            voted_for: Some(7),
            ..ProtoPersistentState::default()
        };
        let mut buf = Vec::new();
        bad_vote.encode(&mut buf).unwrap();
        assert!(matches!(
            decode(&buf, 3),
            Err(PersistenceError::VotedForOutOfRange { voted_for: 7, .. })
        ));
    }
}
