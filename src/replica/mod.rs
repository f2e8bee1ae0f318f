mod apply_loop;
mod election;
mod local_state;
mod peers;
mod persistence;
mod replica;
mod replica_api;
mod replica_wiring;
mod write_ahead_log;

pub use local_state::Term;
pub use peers::ReplicaId;
pub use persistence::PersistenceError;
pub use replica_api::AppendEntriesInput;
pub use replica_api::AppendEntriesLogEntry;
pub use replica_api::AppendEntriesOutput;
pub use replica_api::ConflictHint;
pub use replica_api::InstallSnapshotInput;
pub use replica_api::InstallSnapshotOutput;
pub use replica_api::RequestVoteInput;
pub use replica_api::RequestVoteOutput;
pub use replica_api::RpcError;

pub(crate) use apply_loop::run_apply_loop;
pub(crate) use apply_loop::ApplySignal;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use election::TimerEventSink;
pub(crate) use replica::Replica;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::AppendEntriesReplyFromPeerDescriptor;
pub(crate) use replica_api::InstallSnapshotReplyFromPeer;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaCreationError;
pub(crate) use replica_wiring::ReplicaWiringConfig;
pub(crate) use election::SharedRng;
