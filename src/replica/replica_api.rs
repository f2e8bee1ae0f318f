use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::persistence::PersistenceError;
use crate::transport::TransportError;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct RequestVoteInput {
    pub candidate_term: Term,
    pub candidate_id: ReplicaId,
    /// (0, 0) for an empty log.
    pub candidate_last_log_entry: (Term, Index),
}

#[derive(Debug, Clone)]
pub struct RequestVoteOutput {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub leader_previous_log_entry: (Term, Index),
    pub leader_commit_index: Index,
    pub new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesLogEntry {
    pub term: Term,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesOutput {
    pub term: Term,
    pub success: bool,
    /// Set when the follower rejected the request because its log doesn't match at the
    /// leader's previous log entry. Lets the leader skip back a whole term at a time.
    pub conflict: Option<ConflictHint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConflictHint {
    /// Follower has no entry at the previous log index. `next_index` is one past its last entry.
    LogTooShort { next_index: Index },
    /// Follower's entry at the previous log index has `term`, and `first_index` is the first
    /// index the follower holds for that term.
    TermMismatch { term: Term, first_index: Index },
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotOutput {
    pub term: Term,
}

/// RpcError is returned by the receiving side of an RPC when it can't produce a reply at all.
/// Transports should surface it to the caller as a failed call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Replica has been killed")]
    ReplicaKilled,
    #[error("We (server) failed to persist state: {0}")]
    Persistence(#[from] PersistenceError),
}

// ------- Internal callback types --------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteOutput, TransportError>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<AppendEntriesOutput, TransportError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Index,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) result: Result<InstallSnapshotOutput, TransportError>,
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}
