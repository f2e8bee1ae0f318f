use crate::replica::{ReplicaId, Term};
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(ReplicaId),
    FollowerNoLeader,
}

pub(super) fn new(
    initial_term: Term,
    initial_state: ElectionStateSnapshot,
) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel((initial_term, initial_state));

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<(Term, ElectionStateSnapshot)>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, term: Term, new_state: ElectionStateSnapshot) {
        // Nobody listening is fine.
        let _ = self.snd.send((term, new_state));
    }
}

/// Watch semantics: only the latest state is kept, so a slow listener skips intermediate ones.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<(Term, ElectionStateSnapshot)>,
}

impl ElectionStateChangeListener {
    /// Waits for the state to change. None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<(Term, ElectionStateSnapshot)> {
        match self.rcv.changed().await {
            Ok(_) => Some(*self.rcv.borrow()),
            Err(_) => None,
        }
    }

    pub(crate) fn latest(&self) -> (Term, ElectionStateSnapshot) {
        *self.rcv.borrow()
    }
}
