//! This mod is meant to hold most of the code for the library's client-facing API.
mod apply_stream;
mod client;
mod event_bus;
mod options;
mod types;
mod wiring;

pub use apply_stream::ApplyMsg;
pub use apply_stream::ApplyStream;
pub use client::RaftClient;
pub use client::RaftNode;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use types::NodeState;
pub use types::NodeStatus;
pub use types::RaftRole;
pub use types::StartError;
pub use types::StartOutput;
pub use wiring::try_create_raft_client;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
