use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};

/// Something the local replica observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    /// Our role or known leader changed. Only the latest one is kept: a listener that falls
    /// behind sees the newest state, not every step in between.
    Election { term: Term, state: RaftElectionState },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftElectionState {
    Leader,
    Candidate,
    Follower { leader: ReplicaId },
    FollowerNoLeader,
}

pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// Waits for the next change, or None once the replica is dropped.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|(term, state)| election_event(term, state))
    }

    /// The most recent event, without waiting.
    pub fn latest_event(&self) -> RaftEvent {
        let (term, state) = self.election_state_change_listener.latest();
        election_event(term, state)
    }
}

fn election_event(term: Term, state: ElectionStateSnapshot) -> RaftEvent {
    RaftEvent::Election {
        term,
        state: RaftElectionState::from(state),
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftElectionState {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        match election_state {
            ElectionStateSnapshot::Leader => RaftElectionState::Leader,
            ElectionStateSnapshot::Candidate => RaftElectionState::Candidate,
            ElectionStateSnapshot::Follower(leader) => RaftElectionState::Follower { leader },
            ElectionStateSnapshot::FollowerNoLeader => RaftElectionState::FollowerNoLeader,
        }
    }
}
