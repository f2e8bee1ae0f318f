mod common;

use bytes::Bytes;
use raft_replica::{
    AppendEntriesInput, AppendEntriesLogEntry, ApplyMsg, Index, InstallSnapshotInput, LocalNetwork, MemoryPersister,
    PersistenceError, Persister, RaftClient, RaftClientConfig, RaftElectionState, RaftEvent, RaftOptions, ReplicaId,
    RequestVoteInput, RpcError, StartError, Term,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Saves into a `MemoryPersister` until told to fail, then fails every save until told to stop.
struct FailingPersister {
    storage: MemoryPersister,
    failing: AtomicBool,
    successful_saves: AtomicUsize,
}

impl FailingPersister {
    fn new() -> Arc<Self> {
        Arc::new(FailingPersister {
            storage: MemoryPersister::new(),
            failing: AtomicBool::new(false),
            successful_saves: AtomicUsize::new(0),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn successful_saves(&self) -> usize {
        self.successful_saves.load(Ordering::SeqCst)
    }
}

impl Persister for FailingPersister {
    fn save(&self, raft_state: Bytes, snapshot: Bytes) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.storage.save(raft_state, snapshot)?;
        self.successful_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Bytes> {
        self.storage.read_raft_state()
    }

    fn read_snapshot(&self) -> io::Result<Bytes> {
        self.storage.read_snapshot()
    }
}

async fn create(persister: Arc<dyn Persister>, cluster_size: usize, options: RaftOptions) -> RaftClient {
    let network = LocalNetwork::new();
    raft_replica::try_create_raft_client(RaftClientConfig {
        my_replica_id: 0,
        peers: network.clients_for(ReplicaId::new(0), cluster_size),
        persister,
        info_logger: common::create_root_logger(),
        options,
    })
    .await
    .unwrap()
}

// Replica 0 of 3 that stays a follower for the whole test.
async fn create_follower(persister: Arc<dyn Persister>) -> RaftClient {
    let options = RaftOptions {
        follower_min_timeout: Some(Duration::from_secs(60)),
        follower_max_timeout: Some(Duration::from_secs(60)),
        ..RaftOptions::default()
    };
    create(persister, 3, options).await
}

fn t(term: u64) -> Term {
    Term::new(term)
}

fn i(index: u64) -> Index {
    Index::new(index)
}

fn vote(term: u64, candidate: usize) -> RequestVoteInput {
    RequestVoteInput {
        candidate_term: t(term),
        candidate_id: ReplicaId::new(candidate),
        candidate_last_log_entry: (t(0), i(0)),
    }
}

fn append(term: u64, previous: (u64, u64), commit: u64, entry_terms: &[u64]) -> AppendEntriesInput {
    AppendEntriesInput {
        leader_term: t(term),
        leader_id: ReplicaId::new(1),
        leader_previous_log_entry: (t(previous.0), i(previous.1)),
        leader_commit_index: i(commit),
        new_entries: entry_terms
            .iter()
            .map(|term| AppendEntriesLogEntry {
                term: t(*term),
                data: Bytes::from_static(b"cmd"),
            })
            .collect(),
    }
}

fn is_io_failure<T: std::fmt::Debug>(result: &Result<T, RpcError>) -> bool {
    matches!(result, Err(RpcError::Persistence(PersistenceError::Io(_))))
}

#[tokio::test]
async fn vote_is_not_granted_until_saved() {
    let persister = FailingPersister::new();
    let client = create_follower(persister.clone()).await;
    let node = &client.node;

    persister.set_failing(true);
    let result = node.handle_request_vote(vote(1, 1));
    assert!(is_io_failure(&result), "{:?}", result);

    // The candidate retries. Memory already holds the vote, but it isn't durable yet.
    let result = node.handle_request_vote(vote(1, 1));
    assert!(is_io_failure(&result), "{:?}", result);
    assert_eq!(persister.successful_saves(), 0);

    // Once the disk recovers, the retry saves and the vote is granted.
    persister.set_failing(false);
    let output = node.handle_request_vote(vote(1, 1)).unwrap();
    assert!(output.vote_granted);
    assert_eq!(persister.successful_saves(), 1);

    // A replica restarted from what was saved remembers the vote.
    client.node.kill();
    let restarted = create_follower(Arc::new(persister.storage.copy())).await;
    assert_eq!(restarted.node.get_state().term, t(1));
    assert!(!restarted.node.handle_request_vote(vote(1, 2)).unwrap().vote_granted);
}

#[tokio::test]
async fn entries_are_not_acknowledged_until_saved() {
    let persister = FailingPersister::new();
    let mut client = create_follower(persister.clone()).await;

    persister.set_failing(true);
    let result = client.node.handle_append_entries(append(1, (0, 0), 0, &[1]));
    assert!(is_io_failure(&result), "{:?}", result);

    // Same request again: the entry is already in memory, so nothing looks new.
    let result = client.node.handle_append_entries(append(1, (0, 0), 0, &[1]));
    assert!(is_io_failure(&result), "{:?}", result);

    // Heartbeats can't advance the commit index over undurable entries either.
    let result = client.node.handle_append_entries(append(1, (1, 1), 1, &[]));
    assert!(is_io_failure(&result), "{:?}", result);
    assert_eq!(client.node.status().commit_index, i(0));
    assert_eq!(persister.successful_saves(), 0);

    persister.set_failing(false);
    let output = client.node.handle_append_entries(append(1, (1, 1), 1, &[])).unwrap();
    assert!(output.success);
    assert_eq!(persister.successful_saves(), 1);

    let applied = tokio::time::timeout(Duration::from_secs(1), client.apply_stream.next())
        .await
        .expect("nothing applied")
        .expect("apply stream closed");
    assert_eq!(applied.index(), i(1));

    client.node.kill();
    let restarted = create_follower(Arc::new(persister.storage.copy())).await;
    assert_eq!(restarted.node.status().last_log_index, i(1));
}

#[tokio::test]
async fn snapshot_is_not_acknowledged_until_saved() {
    let persister = FailingPersister::new();
    let mut client = create_follower(persister.clone()).await;
    let install = || InstallSnapshotInput {
        leader_term: t(2),
        leader_id: ReplicaId::new(1),
        last_included_index: i(5),
        last_included_term: t(2),
        data: Bytes::from_static(b"state through 5"),
    };

    persister.set_failing(true);
    let result = client.node.handle_install_snapshot(install());
    assert!(is_io_failure(&result), "{:?}", result);

    persister.set_failing(false);
    let output = client.node.handle_install_snapshot(install()).unwrap();
    assert_eq!(output.term, t(2));
    assert_eq!(persister.storage.read_snapshot().unwrap(), Bytes::from_static(b"state through 5"));

    let applied = tokio::time::timeout(Duration::from_secs(1), client.apply_stream.next())
        .await
        .expect("nothing applied")
        .expect("apply stream closed");
    assert_eq!(
        applied,
        ApplyMsg::Snapshot {
            index: i(5),
            term: t(2),
            data: Bytes::from_static(b"state through 5"),
        }
    );
}

#[tokio::test]
async fn failed_start_leaves_no_entry_behind() {
    let persister = FailingPersister::new();
    let mut client = create(
        persister.clone(),
        1,
        RaftOptions {
            rng_seed: Some(7),
            ..RaftOptions::default()
        },
    )
    .await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), client.event_listener.next_event())
            .await
            .expect("no election")
            .expect("replica gone");
        if let RaftEvent::Election {
            state: RaftElectionState::Leader,
            ..
        } = event
        {
            break;
        }
    }

    persister.set_failing(true);
    let result = client.node.start(Bytes::from_static(b"lost"));
    assert!(
        matches!(result, Err(StartError::Persistence(PersistenceError::Io(_)))),
        "{:?}",
        result
    );
    let status = client.node.status();
    assert_eq!(status.last_log_index, i(0));
    assert_eq!(status.commit_index, i(0));

    persister.set_failing(false);
    let output = client.node.start(Bytes::from_static(b"kept")).unwrap();
    assert!(output.is_leader);
    assert_eq!(output.index, i(1));

    let applied = tokio::time::timeout(Duration::from_secs(1), client.apply_stream.next())
        .await
        .expect("nothing applied")
        .expect("apply stream closed");
    assert_eq!(
        applied,
        ApplyMsg::Command {
            index: i(1),
            term: output.term,
            command: Bytes::from_static(b"kept"),
        }
    );
}
