//! How a replica reaches its peers. The replica only needs a client per peer; the receiving
//! side is `RaftNode::handle_*`.
mod local;

use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, RequestVoteInput,
    RequestVoteOutput, RpcError,
};

pub use local::LocalNetwork;

/// A client for one peer. Calls must complete (successfully or not) within a bounded time;
/// the replica never adds its own timeout on top.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, TransportError>;

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, TransportError>;

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer unreachable")]
    Unreachable,
    #[error("Peer failed to handle request: {0}")]
    Remote(#[from] RpcError),
}
