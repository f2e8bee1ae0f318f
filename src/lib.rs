mod api;
mod commitlog;
mod handle;
mod replica;
mod storage;
mod transport;

pub use api::try_create_raft_client;
pub use api::ApplyMsg;
pub use api::ApplyStream;
pub use api::NodeState;
pub use api::NodeStatus;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftElectionState;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftNode;
pub use api::RaftOptions;
pub use api::RaftRole;
pub use api::StartError;
pub use api::StartOutput;
pub use commitlog::Index;
pub use replica::AppendEntriesInput;
pub use replica::AppendEntriesLogEntry;
pub use replica::AppendEntriesOutput;
pub use replica::ConflictHint;
pub use replica::InstallSnapshotInput;
pub use replica::InstallSnapshotOutput;
pub use replica::PersistenceError;
pub use replica::ReplicaId;
pub use replica::RequestVoteInput;
pub use replica::RequestVoteOutput;
pub use replica::RpcError;
pub use replica::Term;
pub use storage::FilePersister;
pub use storage::MemoryPersister;
pub use storage::Persister;
pub use transport::LocalNetwork;
pub use transport::RaftTransport;
pub use transport::TransportError;

// `crate::{root_mod}` holds no code, only `mod` and `pub use` statements. No `mod` is `pub`;
// everything public is exported through an individual `pub use`.
