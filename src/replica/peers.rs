use crate::transport::RaftTransport;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// ReplicaId is a replica's position in the cluster's peer list.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(usize);

impl ReplicaId {
    pub fn new(id: usize) -> Self {
        ReplicaId(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) id: ReplicaId,
    pub(crate) client: Arc<dyn RaftTransport>,
}

pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    peers: HashMap<ReplicaId, Peer>,
}

#[derive(Debug, thiserror::Error)]
#[error("replica {my_replica_id} is not in a cluster of {cluster_size}")]
pub(crate) struct MeNotInCluster {
    pub(crate) my_replica_id: usize,
    pub(crate) cluster_size: usize,
}

impl ClusterTracker {
    /// `transports[i]` reaches replica `i`. The entry at our own position is never called.
    pub(crate) fn create_valid_cluster(
        my_replica_id: ReplicaId,
        transports: Vec<Arc<dyn RaftTransport>>,
    ) -> Result<Self, MeNotInCluster> {
        if my_replica_id.as_usize() >= transports.len() {
            return Err(MeNotInCluster {
                my_replica_id: my_replica_id.as_usize(),
                cluster_size: transports.len(),
            });
        }

        let peers = transports
            .into_iter()
            .enumerate()
            .map(|(i, client)| (ReplicaId::new(i), client))
            .filter(|(id, _)| *id != my_replica_id)
            .map(|(id, client)| (id, Peer { id, client }))
            .collect();

        Ok(ClusterTracker { my_replica_id, peers })
    }

    pub(crate) fn my_replica_id(&self) -> ReplicaId {
        self.my_replica_id
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn contains_member(&self, id: &ReplicaId) -> bool {
        *id == self.my_replica_id || self.peers.contains_key(id)
    }

    pub(crate) fn peer(&self, id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.keys().copied().collect()
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
}
