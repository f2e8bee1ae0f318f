//! In-process cluster harness. Every replica's ApplyStream is drained by a task that checks
//! apply order and that all replicas agree on what was committed at each index.
#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use raft_replica::{
    ApplyMsg, Index, LocalNetwork, MemoryPersister, RaftClientConfig, RaftNode, RaftOptions, ReplicaId, Term,
};
use slog::Drain;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

// Cluster takes a few election timeouts to settle; tests should budget that.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct Cluster {
    pub network: LocalNetwork,
    logger: slog::Logger,
    nodes: Vec<Option<Arc<RaftNode>>>,
    persisters: Vec<MemoryPersister>,
    applied: Arc<Mutex<Applied>>,
    snapshot_every: Option<u64>,
}

#[derive(Default)]
struct Applied {
    // Per replica: every command it has applied (or learned from a snapshot), by index.
    logs: HashMap<usize, BTreeMap<Index, u64>>,
    last_applied: HashMap<usize, Index>,
    // Whatever was applied first at each index, by anyone.
    committed: HashMap<Index, u64>,
    errors: Vec<String>,
}

impl Cluster {
    pub async fn new(num_members: usize) -> Self {
        Self::with_snapshots(num_members, None).await
    }

    /// Every replica snapshots its state machine each time it applies an index divisible by
    /// `snapshot_every`.
    pub async fn with_snapshots(num_members: usize, snapshot_every: Option<u64>) -> Self {
        let mut cluster = Cluster {
            network: LocalNetwork::new(),
            logger: create_root_logger(),
            nodes: (0..num_members).map(|_| None).collect(),
            persisters: (0..num_members).map(|_| MemoryPersister::new()).collect(),
            applied: Arc::new(Mutex::new(Applied::default())),
            snapshot_every,
        };
        for i in 0..num_members {
            cluster.start(i).await;
        }

        cluster
    }

    pub fn num_members(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, i: usize) -> &RaftNode {
        self.nodes[i].as_ref().expect("replica is crashed")
    }

    /// Start (or restart) replica `i` from whatever its persister holds.
    pub async fn start(&mut self, i: usize) {
        self.crash(i);

        let client = raft_replica::try_create_raft_client(RaftClientConfig {
            my_replica_id: i,
            peers: self.network.clients_for(ReplicaId::new(i), self.num_members()),
            persister: Arc::new(self.persisters[i].clone()),
            info_logger: self.logger.new(slog::o!("Node" => i)),
            options: RaftOptions::default(),
        })
        .await
        .expect("failed to create replica");

        let node = Arc::new(client.node);
        {
            let mut applied = lock(&self.applied);
            applied.logs.insert(i, BTreeMap::new());
            applied.last_applied.insert(i, Index::zero());
        }
        tokio::spawn(drain_apply_stream(
            i,
            client.apply_stream,
            node.clone(),
            self.applied.clone(),
            self.snapshot_every,
        ));

        self.network.register(ReplicaId::new(i), &node);
        self.nodes[i] = Some(node);
    }

    /// Kill replica `i`. Its saved state survives for the next `start(i)`, but nothing the
    /// killed replica still has in flight can write to it.
    pub fn crash(&mut self, i: usize) {
        if let Some(node) = self.nodes[i].take() {
            node.kill();
            self.network.unregister(ReplicaId::new(i));
            self.persisters[i] = self.persisters[i].copy();
        }
    }

    pub fn disconnect(&self, i: usize) {
        self.network.disconnect(ReplicaId::new(i));
    }

    pub fn connect(&self, i: usize) {
        self.network.connect(ReplicaId::new(i));
    }

    pub fn shutdown(&mut self) {
        for i in 0..self.num_members() {
            self.crash(i);
        }
    }

    fn is_up(&self, i: usize) -> bool {
        self.nodes[i].is_some() && self.network.is_connected(ReplicaId::new(i))
    }

    /// Waits for exactly one leader among connected replicas and returns it. Panics if two
    /// replicas lead the same term.
    pub async fn check_one_leader(&self) -> usize {
        for _ in 0..10 {
            sleep_rand_election().await;

            let mut leaders: BTreeMap<Term, Vec<usize>> = BTreeMap::new();
            for i in (0..self.num_members()).filter(|i| self.is_up(*i)) {
                let state = self.node(i).get_state();
                if state.is_leader {
                    leaders.entry(state.term).or_default().push(i);
                }
            }

            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {:?} has {} leaders: {:?}", term, ids.len(), ids);
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }

        panic!("expected one leader, got none");
    }

    pub fn check_no_leader(&self) {
        for i in (0..self.num_members()).filter(|i| self.is_up(*i)) {
            assert!(!self.node(i).get_state().is_leader, "replica {} unexpectedly leader", i);
        }
    }

    /// All connected replicas agree on the term.
    pub fn check_terms(&self) -> Term {
        let mut term = None;
        for i in (0..self.num_members()).filter(|i| self.is_up(*i)) {
            let t = self.node(i).get_state().term;
            match term {
                None => term = Some(t),
                Some(term) => assert_eq!(term, t, "replicas disagree on term"),
            }
        }

        term.expect("no replica is up")
    }

    /// How many replicas have applied `index`, and what they applied.
    pub fn n_committed(&self, index: Index) -> (usize, Option<u64>) {
        let applied = lock(&self.applied);
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);

        let mut count = 0;
        let mut command = None;
        for log in applied.logs.values() {
            if let Some(cmd) = log.get(&index) {
                if let Some(existing) = command {
                    assert_eq!(existing, *cmd, "replicas applied different commands at {:?}", index);
                }
                count += 1;
                command = Some(*cmd);
            }
        }

        (count, command)
    }

    /// Submits `cmd` until some leader commits it on at least `expected_servers` replicas.
    /// Returns its index. With `retry`, a command that was accepted but lost to a leadership
    /// change is submitted again.
    pub async fn one(&self, cmd: u64, expected_servers: usize, retry: bool) -> Index {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut starts = 0;
        while Instant::now() < deadline {
            let mut index = None;
            for _ in 0..self.num_members() {
                starts = (starts + 1) % self.num_members();
                if !self.is_up(starts) {
                    continue;
                }
                let output = self.node(starts).start(encode_command(cmd)).expect("start failed");
                if output.is_leader {
                    index = Some(output.index);
                    break;
                }
            }

            if let Some(index) = index {
                let committed_by = Instant::now() + Duration::from_secs(2);
                while Instant::now() < committed_by {
                    let (count, command) = self.n_committed(index);
                    if count >= expected_servers && command == Some(cmd) {
                        return index;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                if !retry {
                    panic!("command {} failed to reach agreement", cmd);
                }
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        panic!("command {} failed to reach agreement", cmd);
    }

    /// Waits for at least `n` replicas to apply `index`.
    pub async fn wait(&self, index: Index, n: usize) -> Option<u64> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let (count, command) = self.n_committed(index);
            if count >= n {
                return command;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("only {} replicas applied {:?}", self.n_committed(index).0, index);
    }

    pub fn check_no_apply_errors(&self) {
        let applied = lock(&self.applied);
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_apply_stream(
    i: usize,
    mut stream: raft_replica::ApplyStream,
    node: Arc<RaftNode>,
    applied: Arc<Mutex<Applied>>,
    snapshot_every: Option<u64>,
) {
    while let Some(msg) = stream.next().await {
        let snapshot = {
            let mut applied = lock(&applied);
            applied.record(i, msg);
            match (snapshot_every, applied.last_applied[&i]) {
                (Some(every), index) if !index.is_zero() && index.as_u64() % every == 0 => {
                    Some((index, encode_snapshot(&applied.logs[&i], index)))
                }
                _ => None,
            }
        };

        if let Some((index, data)) = snapshot {
            node.snapshot(index, data);
        }
    }
}

impl Applied {
    fn record(&mut self, i: usize, msg: ApplyMsg) {
        let last_applied = self.last_applied[&i];
        match msg {
            ApplyMsg::Command { index, command, .. } => {
                if index != last_applied.plus(1) {
                    self.errors
                        .push(format!("replica {} applied {:?} after {:?}", i, index, last_applied));
                }
                let cmd = decode_command(command);
                self.check_agreement(i, index, cmd);
                self.logs.entry(i).or_default().insert(index, cmd);
                self.last_applied.insert(i, index);
            }
            ApplyMsg::Snapshot { index, data, .. } => {
                if index <= last_applied {
                    self.errors.push(format!(
                        "replica {} installed snapshot {:?} after applying {:?}",
                        i, index, last_applied
                    ));
                }
                let log = decode_snapshot(data);
                for (idx, cmd) in &log {
                    self.check_agreement(i, *idx, *cmd);
                }
                self.logs.insert(i, log);
                self.last_applied.insert(i, index);
            }
        }
    }

    fn check_agreement(&mut self, i: usize, index: Index, cmd: u64) {
        match self.committed.get(&index) {
            Some(existing) if *existing != cmd => self.errors.push(format!(
                "replica {} applied {} at {:?}, but {} was applied there before",
                i, cmd, index, existing
            )),
            Some(_) => {}
            None => {
                self.committed.insert(index, cmd);
            }
        }
    }
}

pub fn encode_command(cmd: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(cmd);
    buf.freeze()
}

fn decode_command(mut command: Bytes) -> u64 {
    command.get_u64()
}

// Snapshot layout: (index, command) pairs, both u64.
fn encode_snapshot(log: &BTreeMap<Index, u64>, through: Index) -> Bytes {
    let mut buf = BytesMut::new();
    for (index, cmd) in log.range(..=through) {
        buf.put_u64(index.as_u64());
        buf.put_u64(*cmd);
    }
    buf.freeze()
}

fn decode_snapshot(mut data: Bytes) -> BTreeMap<Index, u64> {
    let mut log = BTreeMap::new();
    while data.remaining() >= 16 {
        let index = Index::new(data.get_u64());
        log.insert(index, data.get_u64());
    }
    log
}

fn lock(applied: &Mutex<Applied>) -> MutexGuard<'_, Applied> {
    applied.lock().unwrap_or_else(PoisonError::into_inner)
}

pub async fn sleep_rand_election() {
    tokio::time::sleep(Duration::from_millis(450 + rand::random::<u64>() % 100)).await;
}

/// Logs are discarded unless `RAFT_TEST_LOG_DIR` names a directory to write them to.
pub fn create_root_logger() -> slog::Logger {
    let directory = match std::env::var("RAFT_TEST_LOG_DIR") {
        Ok(directory) => directory,
        Err(_) => return slog::Logger::root(slog::Discard, slog::o!()),
    };

    let now = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let log_path = format!("{}/{}_info.log", directory, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .unwrap_or_else(|e| panic!("failed to open log file {}: {}", log_path, e));

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
