use crate::api::{ApplyStream, NodeState, NodeStatus, RaftEventListener, StartError, StartOutput};
use crate::commitlog::Index;
use crate::handle::{ReplicaHandle, WeakReplicaHandle};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, RequestVoteInput,
    RequestVoteOutput, RpcError,
};
use bytes::Bytes;

/// Everything an application gets back from `try_create_raft_client()`.
pub struct RaftClient {
    pub node: RaftNode,
    pub apply_stream: ApplyStream,
    pub event_listener: RaftEventListener,
}

/// RaftNode is the application's (and the transport's) way into a running replica. Dropping it
/// stops the replica, same as `kill()`.
pub struct RaftNode {
    handle: ReplicaHandle,
}

impl RaftNode {
    pub(crate) fn new(handle: ReplicaHandle) -> Self {
        RaftNode { handle }
    }

    /// Propose `command` for the replicated log. Returns right after the entry is durably in our
    /// own log; the entry shows up on the `ApplyStream` once committed. A replica that isn't
    /// leader returns `is_leader == false` and the caller should try another replica.
    ///
    /// An entry that was accepted can still be lost if leadership changes before it commits.
    pub fn start(&self, command: Bytes) -> Result<StartOutput, StartError> {
        match self.handle.with_live_replica(|replica| replica.start(command)) {
            Some(result) => result,
            None => Ok(StartOutput {
                index: Index::zero(),
                term: self.get_state().term,
                is_leader: false,
            }),
        }
    }

    pub fn get_state(&self) -> NodeState {
        let mut state = self.handle.with_replica(|replica| replica.get_state());
        state.is_leader &= !self.is_killed();
        state
    }

    pub fn status(&self) -> NodeStatus {
        self.handle.with_replica(|replica| replica.status())
    }

    /// Tell the replica the application has durably captured everything through `index` in
    /// `data`. The replica drops its log through `index`. Ignored if `index` isn't committed yet
    /// or is already covered by a snapshot.
    pub fn snapshot(&self, index: Index, data: Bytes) {
        self.handle.with_live_replica(|replica| replica.snapshot(index, data));
    }

    /// Stop all background work. Idempotent.
    pub fn kill(&self) {
        self.handle.kill();
    }

    pub fn is_killed(&self) -> bool {
        self.handle.is_killed()
    }

    // ------- Receiving side of the peer RPCs, for transports --------

    pub fn handle_request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        self.handle.weak().request_vote(input)
    }

    pub fn handle_append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        self.handle.weak().append_entries(input)
    }

    pub fn handle_install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, RpcError> {
        self.handle.weak().install_snapshot(input)
    }

    pub(crate) fn weak_handle(&self) -> WeakReplicaHandle {
        self.handle.weak()
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.handle.kill();
    }
}
