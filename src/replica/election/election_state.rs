use crate::commitlog::Index;
use crate::handle::WeakReplicaHandle;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{FollowerTimerHandle, LeaderTimerHandle, SharedRng};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub rng: SharedRng,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    sink: WeakReplicaHandle,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower
    /// without a known leader.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        sink: WeakReplicaHandle,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, sink.clone()));
        let (notifier, listener) =
            state_change_listener::new(term, Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            sink,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<ReplicaId>) {
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.sink.clone()));
        self.notify_new_state(term);
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState::new(&self.config, self.sink.clone());

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id);

        self.state = State::Candidate(cs);
        self.notify_new_state(term);
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: HashSet<ReplicaId>, last_log_index: Index) {
        self.state = State::Leader(LeaderState::new(
            peer_ids,
            last_log_index,
            self.config.leader_heartbeat_duration,
            self.sink.clone(),
            term,
        ));
        self.notify_new_state(term);
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(&self.state)
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => ElectionStateSnapshot::Follower(*leader_id),
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    /// The leader we know of for the current term, which is us if we are leader.
    pub(crate) fn current_leader(&self) -> Option<ReplicaId> {
        match &self.state {
            State::Leader(_) => Some(self.config.my_replica_id),
            State::Candidate(_) => None,
            State::Follower(fs) => fs.leader,
        }
    }

    fn notify_new_state(&self, term: Term) {
        self.state_change_notifier
            .notify_new_state(term, Self::current_state_impl(&self.state));
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    /// Called when `leader` has proven it is the leader of `term`, our current term. A candidate
    /// gives up its election, and a follower remembers who the leader is. Returns false if we
    /// are the leader ourselves, which would mean two leaders in one term.
    pub(crate) fn accept_leader(&mut self, term: Term, leader: ReplicaId) -> bool {
        match &mut self.state {
            State::Leader(_) => false,
            State::Candidate(_) => {
                self.transition_to_follower(term, Some(leader));
                true
            }
            State::Follower(fs) => {
                if fs.leader.is_none() {
                    fs.leader.replace(leader);
                    self.notify_new_state(term);
                }
                true
            }
        }
    }

    /// True if our election timer was reset after its last timeout fired, so a timeout event
    /// we're about to handle is stale. Always false for a leader.
    pub(crate) fn timeout_reset_since_last_wake(&self) -> bool {
        match &self.state {
            State::Leader(_) => false,
            State::Candidate(cs) => cs.follower_timeout_tracker.reset_since_last_wake(),
            State::Follower(fs) => fs.follower_timeout_tracker.reset_since_last_wake(),
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(cs) => write!(f, "Candidate(Votes={})", cs.received_votes_from.len()),
            State::Follower(FollowerState {
                leader: Some(leader_id),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    follower_timeout_tracker: FollowerTimerHandle,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    follower_timeout_tracker: FollowerTimerHandle,
}

impl LeaderState {
    fn new(
        peer_ids: HashSet<ReplicaId>,
        last_log_index: Index,
        heartbeat_duration: Duration,
        sink: WeakReplicaHandle,
        term: Term,
    ) -> Self {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let leader_timer_handle = LeaderTimerHandle::spawn_timer_task(heartbeat_duration, sink.clone(), peer_id, term);
            peer_state.insert(peer_id, PeerState::new(leader_timer_handle, last_log_index));
        }

        Self {
            tracker: LeaderStateTracker::new(peer_state),
        }
    }
}

impl CandidateState {
    fn new(config: &ElectionConfig, sink: WeakReplicaHandle) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            follower_timeout_tracker: spawn_follower_timer(config, sink),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<ReplicaId>, config: &ElectionConfig, sink: WeakReplicaHandle) -> Self {
        Self {
            leader,
            follower_timeout_tracker: spawn_follower_timer(config, sink),
        }
    }

    fn reset_timeout(&self) {
        self.follower_timeout_tracker.reset_timeout();
    }
}

fn spawn_follower_timer(config: &ElectionConfig, sink: WeakReplicaHandle) -> FollowerTimerHandle {
    FollowerTimerHandle::spawn_timer_task(
        config.follower_min_timeout,
        config.follower_max_timeout,
        config.rng.clone(),
        sink,
    )
}
