use crate::api::RaftNode;
use crate::handle::WeakReplicaHandle;
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, ReplicaId,
    RequestVoteInput, RequestVoteOutput, RpcError,
};
use crate::transport::{RaftTransport, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Duration;

/// LocalNetwork connects replicas living in the same process. Each replica can be disconnected
/// and reconnected to simulate partitions, and the whole network can be made unreliable (random
/// delays, lost requests and lost replies).
#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

struct NetworkState {
    nodes: HashMap<ReplicaId, WeakReplicaHandle>,
    connected: HashSet<ReplicaId>,
    reliable: bool,
    rng: StdRng,
    rpc_count: u64,
}

// How long a call to an unreachable replica takes to fail.
const UNREACHABLE_MAX_DELAY: Duration = Duration::from_millis(50);
// Extra latency added to every call on an unreliable network.
const UNRELIABLE_MAX_DELAY: Duration = Duration::from_millis(27);
// On an unreliable network, 1 in N requests and 1 in N replies are lost.
const UNRELIABLE_LOSS_ONE_IN: u32 = 10;

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                nodes: HashMap::new(),
                connected: HashSet::new(),
                reliable: true,
                rng: StdRng::from_entropy(),
                rpc_count: 0,
            })),
        }
    }

    /// A client that sends from replica `from` to replica `to`.
    pub fn client(&self, from: ReplicaId, to: ReplicaId) -> Arc<dyn RaftTransport> {
        Arc::new(LocalClient {
            network: self.clone(),
            from,
            to,
        })
    }

    /// One client per cluster member, in the shape `RaftClientConfig::peers` expects.
    pub fn clients_for(&self, from: ReplicaId, cluster_size: usize) -> Vec<Arc<dyn RaftTransport>> {
        (0..cluster_size)
            .map(|to| self.client(from, ReplicaId::new(to)))
            .collect()
    }

    /// Route calls addressed to `id` to `node`, and connect it.
    pub fn register(&self, id: ReplicaId, node: &RaftNode) {
        let mut state = self.lock();
        state.nodes.insert(id, node.weak_handle());
        state.connected.insert(id);
    }

    /// Forget the replica at `id`; calls to it fail until something is registered again.
    pub fn unregister(&self, id: ReplicaId) {
        let mut state = self.lock();
        state.nodes.remove(&id);
        state.connected.remove(&id);
    }

    pub fn connect(&self, id: ReplicaId) {
        self.lock().connected.insert(id);
    }

    pub fn disconnect(&self, id: ReplicaId) {
        self.lock().connected.remove(&id);
    }

    pub fn is_connected(&self, id: ReplicaId) -> bool {
        self.lock().connected.contains(&id)
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.lock().reliable = reliable;
    }

    /// Total number of calls attempted on this network.
    pub fn rpc_count(&self) -> u64 {
        self.lock().rpc_count
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, from: ReplicaId, to: ReplicaId) -> (Option<WeakReplicaHandle>, Duration) {
        let mut state = self.lock();
        state.rpc_count += 1;

        let target = state.nodes.get(&to).cloned();
        if !state.is_link_up(from, to) || target.is_none() {
            let delay = state.rng.gen_range(Duration::from_millis(0)..=UNREACHABLE_MAX_DELAY);
            return (None, delay);
        }

        if state.reliable {
            return (target, Duration::from_millis(0));
        }

        let delay = state.rng.gen_range(Duration::from_millis(0)..=UNRELIABLE_MAX_DELAY);
        if state.rng.gen_ratio(1, UNRELIABLE_LOSS_ONE_IN) {
            (None, delay)
        } else {
            (target, delay)
        }
    }

    fn is_reply_delivered(&self, from: ReplicaId, to: ReplicaId) -> bool {
        let mut state = self.lock();
        if !state.is_link_up(from, to) {
            return false;
        }

        state.reliable || !state.rng.gen_ratio(1, UNRELIABLE_LOSS_ONE_IN)
    }
}

impl NetworkState {
    fn is_link_up(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.connected.contains(&from) && self.connected.contains(&to)
    }
}

struct LocalClient {
    network: LocalNetwork,
    from: ReplicaId,
    to: ReplicaId,
}

impl LocalClient {
    async fn call<T, F>(&self, handler: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(WeakReplicaHandle) -> Result<T, RpcError> + Send + 'static,
    {
        let (target, delay) = self.network.route(self.from, self.to);
        if delay > Duration::from_millis(0) {
            tokio::time::sleep(delay).await;
        }
        let target = target.ok_or(TransportError::Unreachable)?;

        // Receiver handles each call on its own task.
        let reply = tokio::task::spawn(async move { handler(target) })
            .await
            .map_err(|_| TransportError::Unreachable)?;

        if !self.network.is_reply_delivered(self.from, self.to) {
            return Err(TransportError::Unreachable);
        }

        Ok(reply?)
    }
}

#[async_trait::async_trait]
impl RaftTransport for LocalClient {
    async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, TransportError> {
        self.call(move |target| target.request_vote(input)).await
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, TransportError> {
        self.call(move |target| target.append_entries(input)).await
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, TransportError> {
        self.call(move |target| target.install_snapshot(input)).await
    }
}
