//! Shared ownership of a replica. Everything that touches replica state (inbound RPCs, timers,
//! outbound RPC replies, the apply loop) goes through one of these handles and the one mutex they
//! wrap. Background tasks only ever hold a `WeakReplicaHandle`, so they stop doing work once the
//! replica is killed or dropped.
use crate::api::ApplyMsg;
use crate::commitlog::Index;
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, ApplySignal, InstallSnapshotInput,
    InstallSnapshotOutput, InstallSnapshotReplyFromPeer, LeaderTimerTick, Replica, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, RpcError, TimerEventSink,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

struct ReplicaCell {
    replica: Mutex<Replica>,
    killed: AtomicBool,
    apply_signal: ApplySignal,
}

impl ReplicaCell {
    fn lock(&self) -> MutexGuard<'_, Replica> {
        // A panic while holding the lock doesn't leave the replica in a state we can't read.
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_live_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> Option<R> {
        if self.killed.load(Ordering::Acquire) {
            return None;
        }

        Some(f(&mut self.lock()))
    }
}

impl Drop for ReplicaCell {
    fn drop(&mut self) {
        // Let the apply loop notice we're gone.
        self.apply_signal.notify();
    }
}

pub(crate) struct ReplicaHandle {
    cell: Arc<ReplicaCell>,
}

#[derive(Clone)]
pub(crate) struct WeakReplicaHandle {
    cell: Weak<ReplicaCell>,
}

impl ReplicaHandle {
    /// `create` receives the weak handle the replica will give to its own background tasks.
    pub(crate) fn new_cyclic(apply_signal: ApplySignal, create: impl FnOnce(WeakReplicaHandle) -> Replica) -> Self {
        let cell = Arc::new_cyclic(|weak_cell| ReplicaCell {
            replica: Mutex::new(create(WeakReplicaHandle {
                cell: weak_cell.clone(),
            })),
            killed: AtomicBool::new(false),
            apply_signal,
        });

        ReplicaHandle { cell }
    }

    pub(crate) fn weak(&self) -> WeakReplicaHandle {
        WeakReplicaHandle {
            cell: Arc::downgrade(&self.cell),
        }
    }

    /// Unlike the weak handle, this still runs `f` after kill, so a killed replica can be
    /// inspected.
    pub(crate) fn with_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> R {
        f(&mut self.cell.lock())
    }

    pub(crate) fn with_live_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> Option<R> {
        self.cell.with_live_replica(f)
    }

    /// Idempotent.
    pub(crate) fn kill(&self) {
        if !self.cell.killed.swap(true, Ordering::AcqRel) {
            self.cell.lock().handle_kill();
            self.cell.apply_signal.notify();
        }
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.cell.killed.load(Ordering::Acquire)
    }
}

impl WeakReplicaHandle {
    /// None if the replica is gone or killed.
    pub(crate) fn with_live_replica<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> Option<R> {
        let cell = self.cell.upgrade()?;
        cell.with_live_replica(f)
    }

    // ------- Inbound RPCs --------

    pub(crate) fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        self.with_live_replica(|replica| replica.server_handle_request_vote(input))
            .ok_or(RpcError::ReplicaKilled)?
    }

    pub(crate) fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        self.with_live_replica(|replica| replica.server_handle_append_entries(input))
            .ok_or(RpcError::ReplicaKilled)?
    }

    pub(crate) fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, RpcError> {
        self.with_live_replica(|replica| replica.server_handle_install_snapshot(input))
            .ok_or(RpcError::ReplicaKilled)?
    }

    // ------- Replies to our outbound RPCs --------

    pub(crate) fn notify_request_vote_reply_from_peer(&self, reply: RequestVoteReplyFromPeer) {
        self.with_live_replica(|replica| replica.handle_request_vote_reply_from_peer(reply));
    }

    pub(crate) fn notify_append_entries_reply_from_peer(&self, reply: AppendEntriesReplyFromPeer) {
        self.with_live_replica(|replica| replica.handle_append_entries_reply_from_peer(reply));
    }

    pub(crate) fn notify_install_snapshot_reply_from_peer(&self, reply: InstallSnapshotReplyFromPeer) {
        self.with_live_replica(|replica| replica.handle_install_snapshot_reply_from_peer(reply));
    }

    // ------- Apply loop --------

    /// Outer None means the replica is gone; inner None means there's nothing to apply.
    pub(crate) fn take_apply_batch(&self) -> Option<Option<(Vec<ApplyMsg>, Index)>> {
        self.with_live_replica(|replica| replica.take_apply_batch())
    }

    pub(crate) fn mark_applied(&self, index: Index) -> bool {
        self.with_live_replica(|replica| replica.mark_applied(index)).is_some()
    }
}

impl TimerEventSink for WeakReplicaHandle {
    fn follower_timeout(&self) -> bool {
        self.with_live_replica(|replica| replica.handle_follower_timeout())
            .is_some()
    }

    fn leader_timer(&self, tick: LeaderTimerTick) -> bool {
        self.with_live_replica(|replica| replica.handle_leader_timer(tick))
            .is_some()
    }
}
