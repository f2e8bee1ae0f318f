use crate::handle::ReplicaHandle;
use crate::replica::election::SharedRng;
use crate::replica::peers::{ClusterTracker, MeNotInCluster, ReplicaId};
use crate::replica::persistence::{self, PersistenceError};
use crate::replica::replica::{Replica, ReplicaConfig};
use crate::replica::ApplySignal;
use crate::storage::Persister;
use crate::transport::RaftTransport;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ReplicaWiringConfig {
    pub logger: slog::Logger,
    pub my_replica_id: ReplicaId,
    pub transports: Vec<Arc<dyn RaftTransport>>,
    pub persister: Arc<dyn Persister>,
    pub rng: SharedRng,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub max_entries_per_append: usize,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplicaCreationError {
    #[error(transparent)]
    MeNotInCluster(#[from] MeNotInCluster),
    #[error("Failed to read persisted state: {0}")]
    StorageIo(io::Error),
    #[error("Persisted state is unusable: {0}")]
    CorruptPersistentState(PersistenceError),
}

/// Restores whatever the persister holds and builds a live replica. Must be called from within a
/// tokio runtime, as the replica spawns its election timer right away.
pub(crate) fn create_replica(config: ReplicaWiringConfig) -> Result<(ReplicaHandle, ApplySignal), ReplicaCreationError> {
    let cluster_tracker = ClusterTracker::create_valid_cluster(config.my_replica_id, config.transports)?;

    let raft_state = config
        .persister
        .read_raft_state()
        .map_err(ReplicaCreationError::StorageIo)?;
    let restored_state = persistence::decode(&raft_state, cluster_tracker.num_voting_replicas())
        .map_err(ReplicaCreationError::CorruptPersistentState)?;
    let restored_snapshot = match &restored_state {
        Some(_) => config
            .persister
            .read_snapshot()
            .map_err(ReplicaCreationError::StorageIo)?,
        None => bytes::Bytes::new(),
    };

    let logger = config
        .logger
        .new(slog::o!("ReplicaId" => format!("{:?}", config.my_replica_id)));
    let apply_signal = ApplySignal::new();
    let replica_config = ReplicaConfig {
        logger,
        cluster_tracker,
        persister: config.persister,
        restored_state,
        restored_snapshot,
        apply_signal: apply_signal.clone(),
        rng: config.rng,
        leader_heartbeat_duration: config.leader_heartbeat_duration,
        follower_min_timeout: config.follower_min_timeout,
        follower_max_timeout: config.follower_max_timeout,
        max_entries_per_append: config.max_entries_per_append,
    };

    let handle = ReplicaHandle::new_cyclic(apply_signal.clone(), |callback| Replica::new(replica_config, callback));

    Ok((handle, apply_signal))
}
