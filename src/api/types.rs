use crate::commitlog::Index;
use crate::replica::{PersistenceError, ReplicaId, Term};

#[derive(Clone, Debug, PartialEq)]
pub struct StartOutput {
    /// Where the command will appear if it commits. Meaningless when `is_leader` is false.
    pub index: Index,
    pub term: Term,
    pub is_leader: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Failed to persist new log entry: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeState {
    pub term: Term,
    pub is_leader: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

/// A point-in-time view of a replica, for tests and operators.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub term: Term,
    pub role: RaftRole,
    /// The leader of `term` as far as we know. That's us when `role` is Leader.
    pub leader: Option<ReplicaId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
    pub snapshot_index: Index,
}
