use crate::commitlog::Index;
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::ReplicaId;
use std::collections::{HashMap, HashSet};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().copied().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer. None only in tests.
    leader_timer_handler: Option<LeaderTimerHandle>,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Index,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(leader_timer_handler: LeaderTimerHandle, leader_last_log_index: Index) -> Self {
        Self::with_timer(Some(leader_timer_handler), leader_last_log_index)
    }

    fn with_timer(leader_timer_handler: Option<LeaderTimerHandle>, leader_last_log_index: Index) -> Self {
        PeerState {
            leader_timer_handler,
            next: leader_last_log_index.plus(1),
            matched: Index::zero(),
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    /// (nextIndex, index of the entry right before it)
    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Index) {
        (self.next, self.next.minus(1))
    }

    pub(crate) fn next(&self) -> Index {
        self.next
    }

    pub(crate) fn matched(&self) -> Index {
        self.matched
    }

    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action, retry next heartbeat */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.update_matched(previous_log_entry.plus(num_entries_replicated as u64));
            }
            PeerStateUpdate::SnapshotInstalled { last_included_index } => {
                self.update_matched(last_included_index);
            }
            PeerStateUpdate::PeerLogConflict { new_next } => {
                self.rewind_next(logger, new_next);
            }
        }
    }

    fn update_matched(&mut self, new_matched: Index) {
        // A heartbeat can confirm less than we already know. Keep the max.
        if new_matched > self.matched {
            self.matched = new_matched;
        }
        self.next = self.matched.plus(1);
    }

    fn rewind_next(&mut self, logger: &slog::Logger, new_next: Index) {
        // Don't trust the hint below what the peer has already acknowledged.
        let floor = self.matched.plus(1);
        let new_next = new_next.max(floor);
        if new_next >= self.next {
            slog::warn!(
                logger,
                "Conflict hint doesn't move next index back. Next: {:?}, hinted: {:?}, matched: {:?}",
                self.next,
                new_next,
                self.matched
            );
            // Still step back by one so we make progress.
            self.next = self.next.minus(1).max(floor);
            return;
        }

        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        if let Some(timer) = &self.leader_timer_handler {
            timer.reset_heartbeat_timer();
        }
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Index,
        num_entries_replicated: usize,
    },
    SnapshotInstalled {
        last_included_index: Index,
    },
    /// Peer rejected AppendEntries; the leader worked out from the conflict hint where to retry.
    PeerLogConflict {
        new_next: Index,
    },
    OtherError,
}
