use crate::api::apply_stream::ApplyStream;
use crate::api::client::{RaftClient, RaftNode};
use crate::api::options::RaftOptionsValidated;
use crate::api::{RaftEventListener, RaftOptions};
use crate::replica::{self, PersistenceError, ReplicaCreationError, ReplicaId};
use crate::storage::Persister;
use crate::transport::RaftTransport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::convert::TryFrom;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct RaftClientConfig {
    /// Our position in `peers`.
    pub my_replica_id: usize,
    /// One client per cluster member, indexed by replica ID. Ours is never called.
    pub peers: Vec<Arc<dyn RaftTransport>>,
    /// Where term, vote, log and snapshot are saved. Whatever it already holds is restored.
    pub persister: Arc<dyn Persister>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    // We will need to relax this later when adding membership changes.
    #[error("my replica ID {my_replica_id} not in cluster of {cluster_size}")]
    MeNotInCluster { my_replica_id: usize, cluster_size: usize },
    #[error("Persisted raft state is corrupt: {0}")]
    CorruptPersistentState(PersistenceError),
    #[error("Failed to read persisted raft state: {0}")]
    StorageIo(io::Error),
}

/// Restores from `config.persister` and starts the replica's background tasks: the election
/// timer and the apply loop. Returns without waiting for an election.
pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let root_logger = config.info_logger;

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;
    slog::debug!(root_logger, "Creating replica with options {:?}", options);

    let rng = match options.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (handle, apply_signal) = replica::create_replica(replica::ReplicaWiringConfig {
        logger: root_logger.clone(),
        my_replica_id: ReplicaId::new(config.my_replica_id),
        transports: config.peers,
        persister: config.persister,
        rng: Arc::new(Mutex::new(rng)),
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        follower_min_timeout: options.follower_min_timeout,
        follower_max_timeout: options.follower_max_timeout,
        max_entries_per_append: options.max_entries_per_append,
    })
    .map_err(|e| match e {
        ReplicaCreationError::MeNotInCluster(e) => RaftClientCreationError::MeNotInCluster {
            my_replica_id: e.my_replica_id,
            cluster_size: e.cluster_size,
        },
        ReplicaCreationError::StorageIo(e) => RaftClientCreationError::StorageIo(e),
        ReplicaCreationError::CorruptPersistentState(e) => RaftClientCreationError::CorruptPersistentState(e),
    })?;

    let (apply_tx, apply_rx) = mpsc::channel(options.apply_channel_capacity);
    tokio::spawn(replica::run_apply_loop(
        root_logger.new(slog::o!("ReplicaId" => config.my_replica_id, "Task" => "apply")),
        handle.weak(),
        apply_signal,
        apply_tx,
    ));

    let event_listener = RaftEventListener::new(handle.with_replica(|replica| replica.election_state_listener()));

    Ok(RaftClient {
        node: RaftNode::new(handle),
        apply_stream: ApplyStream::new(apply_rx),
        event_listener,
    })
}
