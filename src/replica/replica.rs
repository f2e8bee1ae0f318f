use crate::api::{ApplyMsg, NodeState, NodeStatus, RaftRole, StartError, StartOutput};
use crate::commitlog::{InMemoryLog, Index, Log};
use crate::handle::WeakReplicaHandle;
use crate::replica::election::{ElectionConfig, ElectionState, PeerStateUpdate, SharedRng};
use crate::replica::local_state::{LocalState, Term};
use crate::replica::peers::{ClusterTracker, ReplicaId};
use crate::replica::persistence::{self, PersistenceError, PersistentStateRef, RestoredState};
use crate::replica::replica_api::{
    AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, ConflictHint, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeer, LeaderTimerTick, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RpcError,
};
use crate::replica::write_ahead_log::{Snapshot, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::{ApplySignal, ElectionStateChangeListener, ElectionStateSnapshot};
use crate::storage::Persister;
use crate::transport::RaftTransport;
use bytes::Bytes;
use std::cmp;
use std::sync::Arc;
use tokio::time::Duration;

pub(crate) struct ReplicaConfig {
    pub logger: slog::Logger,
    pub cluster_tracker: ClusterTracker,
    pub persister: Arc<dyn Persister>,
    // None on a fresh start.
    pub restored_state: Option<RestoredState>,
    pub restored_snapshot: Bytes,
    pub apply_signal: ApplySignal,
    pub rng: SharedRng,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub max_entries_per_append: usize,
}

pub(crate) struct Replica {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: LocalState,
    election_state: ElectionState,
    wal: WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>,
    persister: Arc<dyn Persister>,
    // Set while memory holds state that the last save failed to write. Every reply or commit
    // that depends on it has to retry the save first.
    needs_persist: bool,
    // Handed to the tasks we spawn so they can call back into us.
    callback: WeakReplicaHandle,
    apply_signal: ApplySignal,
    max_entries_per_append: usize,
    // Kept so the API layer can subscribe after construction.
    election_state_listener: ElectionStateChangeListener,
}

impl Replica {
    pub(crate) fn new(config: ReplicaConfig, callback: WeakReplicaHandle) -> Self {
        let my_replica_id = config.cluster_tracker.my_replica_id();

        let (local_state, wal) = match config.restored_state {
            None => (
                LocalState::new(my_replica_id),
                WriteAheadLog::new(config.logger.clone(), InMemoryLog::create(), Snapshot::empty()),
            ),
            Some(restored) => {
                let (last_included_term, last_included_index) = restored.last_included;
                let mut log = InMemoryLog::starting_at(last_included_index.plus(1));
                for entry in restored.entries {
                    log.append(entry);
                }
                let snapshot = Snapshot {
                    last_included_index,
                    last_included_term,
                    data: config.restored_snapshot,
                };

                (
                    LocalState::restore(my_replica_id, restored.current_term, restored.voted_for),
                    WriteAheadLog::new(config.logger.clone(), log, snapshot),
                )
            }
        };

        let (election_state, election_state_listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id,
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                follower_min_timeout: config.follower_min_timeout,
                follower_max_timeout: config.follower_max_timeout,
                rng: config.rng,
            },
            callback.clone(),
            local_state.current_term(),
        );

        let replica = Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state,
            election_state,
            wal,
            persister: config.persister,
            needs_persist: false,
            callback,
            apply_signal: config.apply_signal,
            max_entries_per_append: config.max_entries_per_append,
            election_state_listener,
        };
        slog::info!(
            replica.logger,
            "Created replica. Term: {:?}, last entry: {:?}, snapshot index: {:?}",
            replica.local_state.current_term(),
            replica.wal.latest_entry(),
            replica.wal.snapshot().last_included_index,
        );
        // A restored snapshot goes to the state machine before anything else.
        replica.apply_signal.notify();

        replica
    }

    // ------- Node API --------

    pub(crate) fn start(&mut self, command: Bytes) -> Result<StartOutput, StartError> {
        let term = self.local_state.current_term();
        if !self.election_state.is_leader() {
            return Ok(StartOutput {
                index: Index::zero(),
                term,
                is_leader: false,
            });
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let index = self.wal.append(WriteAheadLogEntry { term, data: command });
        if let Err(e) = self.persist() {
            slog::error!(self.logger, "Failed to persist new entry {:?}: {}", index, e);
            self.wal.truncate(index);
            return Err(StartError::Persistence(e));
        }
        slog::debug!(self.logger, "Appended entry {:?} for term {:?}", index, term);

        // Only matters for a single replica cluster, where nobody will ever reply to us.
        self.advance_leader_commit_index();

        // Don't wait for the next heartbeat to start replicating.
        for peer_id in self.cluster_tracker.peer_ids() {
            self.handle_leader_timer(LeaderTimerTick { peer_id, term });
        }

        Ok(StartOutput {
            index,
            term,
            is_leader: true,
        })
    }

    pub(crate) fn snapshot(&mut self, index: Index, data: Bytes) {
        if !self.wal.compact(index, data) {
            return;
        }

        slog::info!(self.logger, "Compacted log through {:?}", index);
        if let Err(e) = self.persist() {
            slog::error!(self.logger, "Failed to persist snapshot at {:?}: {}", index, e);
        }
    }

    pub(crate) fn get_state(&self) -> NodeState {
        NodeState {
            term: self.local_state.current_term(),
            is_leader: self.election_state.is_leader(),
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        let role = match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => RaftRole::Leader,
            ElectionStateSnapshot::Candidate => RaftRole::Candidate,
            ElectionStateSnapshot::Follower(_) | ElectionStateSnapshot::FollowerNoLeader => RaftRole::Follower,
        };

        NodeStatus {
            term: self.local_state.current_term(),
            role,
            leader: self.election_state.current_leader(),
            commit_index: self.wal.commit_index(),
            last_applied: self.wal.last_applied(),
            last_log_index: self.wal.last_index(),
            snapshot_index: self.wal.snapshot().last_included_index,
        }
    }

    pub(crate) fn election_state_listener(&self) -> ElectionStateChangeListener {
        self.election_state_listener.clone()
    }

    pub(crate) fn handle_kill(&mut self) {
        slog::info!(self.logger, "Killed while {:?}", self.election_state);
    }

    pub(crate) fn take_apply_batch(&mut self) -> Option<(Vec<ApplyMsg>, Index)> {
        self.wal.take_apply_batch()
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.wal.mark_applied(index);
    }

    // ------- Server side of RPCs --------

    pub(crate) fn server_handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        let current_term = self.local_state.current_term();

        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::warn!(self.logger, "Not granting vote to unknown replica {:?}", input.candidate_id);
            return Ok(RequestVoteOutput {
                term: current_term,
                vote_granted: false,
            });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(
                self.logger,
                "Not granting vote to {:?}. Candidate term {:?} is out of date.",
                input.candidate_id,
                input.candidate_term
            );
            return Ok(RequestVoteOutput {
                term: current_term,
                vote_granted: false,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let mut state_changed = false;
        if self.local_state.store_term_if_increased(input.candidate_term) {
            self.election_state.transition_to_follower(input.candidate_term, None);
            slog::info!(
                self.logger,
                "Observed increased term {:?} in RequestVote call. Election state: {:?}",
                input.candidate_term,
                self.election_state
            );
            state_changed = true;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        let (current_term, opt_voted_for) = self.local_state.voted_for_current_term();
        let vote_granted = match opt_voted_for {
            Some(voted_for) if voted_for != input.candidate_id => {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                false
            }
            _ if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) => {
                slog::info!(
                    self.logger,
                    "Not granting vote to {:?}. Candidate log {:?} is behind ours {:?}.",
                    input.candidate_id,
                    input.candidate_last_log_entry,
                    self.wal.latest_entry()
                );
                false
            }
            // Candidate retried.
            Some(_) => true,
            None => {
                self.local_state
                    .store_vote_for_term_if_unvoted(current_term, input.candidate_id);
                state_changed = true;
                true
            }
        };

        self.persist_if(state_changed)?;
        if vote_granted {
            slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, current_term);
            self.election_state.reset_timeout_if_follower();
        }

        Ok(RequestVoteOutput {
            term: current_term,
            vote_granted,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: (Term, Index)) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        candidate_last_entry >= self.wal.latest_entry()
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, RpcError> {
        let current_term = self.local_state.current_term();
        let reject = |conflict: Option<ConflictHint>| AppendEntriesOutput {
            term: current_term,
            success: false,
            conflict,
        };

        // Ensure leader is known member.
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            slog::warn!(self.logger, "Rejecting AppendEntries from unknown replica {:?}", input.leader_id);
            return Ok(reject(None));
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if input.leader_term < current_term {
            return Ok(reject(None));
        }

        let term_changed = match self.observe_leader(input.leader_term, input.leader_id) {
            Some(term_changed) => term_changed,
            None => return Ok(reject(None)),
        };
        let current_term = input.leader_term;

        let outcome = self.append_leader_entries(&input);
        let log_changed = matches!(outcome, AppendOutcome::Appended { log_changed: true });
        self.persist_if(term_changed || log_changed)?;

        match outcome {
            AppendOutcome::Rejected(conflict) => {
                slog::debug!(
                    self.logger,
                    "Rejecting AppendEntries at {:?}: {:?}",
                    input.leader_previous_log_entry,
                    conflict
                );
                Ok(AppendEntriesOutput {
                    term: current_term,
                    success: false,
                    conflict,
                })
            }
            AppendOutcome::Appended { .. } => {
                // 5. If leaderCommit > commitIndex, set commitIndex =
                // min(leaderCommit, index of last new entry)
                let (_, previous_log_entry_index) = input.leader_previous_log_entry;
                let index_of_last_new_entry = previous_log_entry_index.plus(input.new_entries.len() as u64);
                let new_commit_index = cmp::min(input.leader_commit_index, index_of_last_new_entry);
                if self.wal.ratchet_fwd_commit_index(new_commit_index) {
                    slog::debug!(self.logger, "Commit index is now {:?}", self.wal.commit_index());
                    self.apply_signal.notify();
                }

                Ok(AppendEntriesOutput {
                    term: current_term,
                    success: true,
                    conflict: None,
                })
            }
        }
    }

    /// Common to AppendEntries and InstallSnapshot: the sender is the leader of `leader_term`,
    /// which is at least our current term. Returns whether our term changed, or None if we are
    /// the leader of that term ourselves.
    fn observe_leader(&mut self, leader_term: Term, leader_id: ReplicaId) -> Option<bool> {
        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let term_changed = self.local_state.store_term_if_increased(leader_term);
        if term_changed {
            self.election_state.transition_to_follower(leader_term, Some(leader_id));
            slog::info!(
                self.logger,
                "Observed increased term {:?} from leader. Election state: {:?}",
                leader_term,
                self.election_state
            );
        } else if !self.election_state.accept_leader(leader_term, leader_id) {
            slog::crit!(
                self.logger,
                "{:?} claims to be leader of term {:?}, but so are we",
                leader_id,
                leader_term
            );
            return None;
        }

        self.election_state.reset_timeout_if_follower();
        Some(term_changed)
    }

    fn append_leader_entries(&mut self, input: &AppendEntriesInput) -> AppendOutcome {
        let (previous_log_entry_term, previous_log_entry_index) = input.leader_previous_log_entry;
        let snapshot_index = self.wal.snapshot().last_included_index;

        // Entries at or before our snapshot are committed, so they must already match. Skip them.
        let num_covered = cmp::min(
            snapshot_index.as_u64().saturating_sub(previous_log_entry_index.as_u64()) as usize,
            input.new_entries.len(),
        );

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if previous_log_entry_index >= snapshot_index {
            match self.wal.term_at(previous_log_entry_index) {
                None => {
                    return AppendOutcome::Rejected(Some(ConflictHint::LogTooShort {
                        next_index: self.wal.last_index().plus(1),
                    }))
                }
                Some(term) if term != previous_log_entry_term => {
                    return AppendOutcome::Rejected(Some(ConflictHint::TermMismatch {
                        term,
                        first_index: self.wal.first_index_of_term(term, previous_log_entry_index),
                    }))
                }
                Some(_) => {}
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut log_changed = false;
        let mut next_entry_index = previous_log_entry_index.plus(1 + num_covered as u64);
        for new_entry in &input.new_entries[num_covered..] {
            match self.wal.term_at(next_entry_index) {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => {}
                // 3. (delete)
                Some(_) => {
                    if !self.wal.truncate(next_entry_index) {
                        return AppendOutcome::Rejected(None);
                    }
                    self.append_from_leader(new_entry);
                    log_changed = true;
                }
                // 4. (append)
                None => {
                    self.append_from_leader(new_entry);
                    log_changed = true;
                }
            }

            next_entry_index = next_entry_index.plus(1);
        }

        AppendOutcome::Appended { log_changed }
    }

    fn append_from_leader(&mut self, entry: &AppendEntriesLogEntry) {
        self.wal.append(WriteAheadLogEntry {
            term: entry.term,
            data: entry.data.clone(),
        });
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, RpcError> {
        let current_term = self.local_state.current_term();

        if !self.cluster_tracker.contains_member(&input.leader_id) {
            slog::warn!(self.logger, "Rejecting InstallSnapshot from unknown replica {:?}", input.leader_id);
            return Ok(InstallSnapshotOutput { term: current_term });
        }

        // 1. Reply immediately if term < currentTerm
        if input.leader_term < current_term {
            return Ok(InstallSnapshotOutput { term: current_term });
        }

        let term_changed = match self.observe_leader(input.leader_term, input.leader_id) {
            Some(term_changed) => term_changed,
            None => return Ok(InstallSnapshotOutput { term: current_term }),
        };

        let installed = self.wal.install_snapshot(Snapshot {
            last_included_index: input.last_included_index,
            last_included_term: input.last_included_term,
            data: input.data,
        });
        if installed {
            slog::info!(
                self.logger,
                "Installed snapshot from {:?} through {:?}",
                input.leader_id,
                input.last_included_index
            );
        } else {
            slog::debug!(
                self.logger,
                "Ignoring stale snapshot through {:?}. Commit index: {:?}",
                input.last_included_index,
                self.wal.commit_index()
            );
        }

        self.persist_if(term_changed || installed)?;
        // Also wakes the apply loop for a snapshot installed by an earlier attempt whose save
        // failed.
        self.apply_signal.notify();

        Ok(InstallSnapshotOutput {
            term: input.leader_term,
        })
    }

    // ------- Timers --------

    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.election_state.is_leader() {
            // Stale timer event from before we became leader.
            return;
        }
        if self.election_state.timeout_reset_since_last_wake() {
            slog::debug!(self.logger, "Ignoring follower timeout, timer was reset after it fired.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.local_state.increment_term_and_vote_for_self();
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Term: {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        // Nobody hears about our vote before it's durable.
        if let Err(e) = self.persist() {
            slog::error!(self.logger, "Failed to persist vote for self in {:?}: {}", new_term, e);
            return;
        }

        if Self::get_majority_vote_count(self.cluster_tracker.num_voting_replicas()) <= 1 {
            self.become_leader(new_term);
            return;
        }

        let request = RequestVoteInput {
            candidate_term: new_term,
            candidate_id: self.my_replica_id,
            candidate_last_log_entry: self.wal.latest_entry(),
        };
        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.new(slog::o!("Peer" => format!("{:?}", peer.id))),
                peer.client.clone(),
                peer.id,
                request.clone(),
                self.callback.clone(),
            ));
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader timer for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        let peer_client = match self.cluster_tracker.peer(&tick.peer_id) {
            Some(peer) => peer.client.clone(),
            None => {
                slog::error!(self.logger, "Missing Peer {:?} in ClusterTracker", tick.peer_id);
                return;
            }
        };

        let peer_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => match leader_state.peer_state_mut(&tick.peer_id) {
                Some(peer_state) => peer_state,
                None => {
                    slog::error!(
                        self.logger,
                        "Peer {:?} is present in ClusterTracker but missing in LeaderStateTracker",
                        tick.peer_id
                    );
                    return;
                }
            },
            None => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.");
                return;
            }
        };

        // Just 1 outstanding request per peer; no pipelining. We still batch log entries.
        if peer_state.has_outstanding_request() {
            slog::debug!(self.logger, "Request to peer {:?} is still outstanding", tick.peer_id);
            return;
        }

        let (next_index, previous_index) = peer_state.next_and_previous_log_index();
        let snapshot = self.wal.snapshot();
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", tick.peer_id)));

        if next_index <= snapshot.last_included_index {
            // The entries this peer needs are gone. Send the snapshot instead.
            let seq_no = peer_state.next_seq_no();
            peer_state.reset_heartbeat_timer();

            let input = InstallSnapshotInput {
                leader_term: current_term,
                leader_id: self.my_replica_id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                data: snapshot.data.clone(),
            };
            tokio::task::spawn(Self::call_peer_install_snapshot(
                logger,
                peer_client,
                tick.peer_id,
                seq_no,
                input,
                self.callback.clone(),
            ));
            return;
        }

        let previous_term = match self.wal.term_at(previous_index) {
            Some(term) => term,
            None => {
                slog::error!(
                    self.logger,
                    "LeaderStateTracker is tracking index {:?} for {:?}, but entry is missing from log.",
                    previous_index,
                    tick.peer_id
                );
                return;
            }
        };

        let seq_no = peer_state.next_seq_no();
        peer_state.reset_heartbeat_timer();

        let new_entries: Vec<_> = self
            .wal
            .entries_from(next_index, self.max_entries_per_append)
            .into_iter()
            .map(|entry| AppendEntriesLogEntry {
                term: entry.term,
                data: entry.data,
            })
            .collect();

        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: tick.peer_id,
            term: current_term,
            seq_no,
            previous_log_entry_index: previous_index,
            num_log_entries: new_entries.len(),
        };
        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: self.my_replica_id,
            leader_previous_log_entry: (previous_term, previous_index),
            leader_commit_index: self.wal.commit_index(),
            new_entries,
        };

        tokio::task::spawn(Self::call_peer_append_entries(
            logger,
            peer_client,
            input,
            descriptor,
            self.callback.clone(),
        ));
    }

    // ------- Replies from peers --------

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let output = match reply.result {
            Ok(output) => output,
            Err(e) => {
                // Next election timeout will retry.
                slog::warn!(self.logger, "RequestVote to {:?} failed: {}", reply.peer_id, e);
                return;
            }
        };

        if self.step_down_if_term_increased(output.term) {
            return;
        }

        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        if !output.vote_granted {
            slog::info!(
                self.logger,
                "Vote not granted from {:?} for term {:?}",
                reply.peer_id,
                reply.term,
            );
            return;
        }

        let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
            Some(v) => v,
            None => {
                slog::debug!(
                    self.logger,
                    "Received vote for term {:?} after transitioning to election state: {:?}",
                    reply.term,
                    self.election_state,
                );
                return;
            }
        };

        let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
        slog::info!(
            self.logger,
            "Received {}/{} votes for term {:?}",
            num_votes_received,
            num_voting_replicas,
            reply.term,
        );

        if num_votes_received >= Self::get_majority_vote_count(num_voting_replicas) {
            self.become_leader(reply.term);
        }
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state
            .transition_to_leader(term, self.cluster_tracker.peer_ids(), self.wal.last_index());
        slog::info!(self.logger, "Became leader for term {:?}", term);
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", descriptor.peer_id), "SeqNo" => descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let update = match reply.result {
            Err(e) => {
                slog::warn!(logger, "AE failure: {}", e);
                PeerStateUpdate::OtherError
            }
            Ok(output) => {
                if self.step_down_if_term_increased(output.term) {
                    return;
                }

                if output.success {
                    PeerStateUpdate::Success {
                        previous_log_entry: descriptor.previous_log_entry_index,
                        num_entries_replicated: descriptor.num_log_entries,
                    }
                } else if let Some(hint) = output.conflict {
                    slog::info!(logger, "Peer log conflicts with ours: {:?}", hint);
                    PeerStateUpdate::PeerLogConflict {
                        new_next: self.next_index_after_conflict(hint),
                    }
                } else {
                    PeerStateUpdate::OtherError
                }
            }
        };

        if self.local_state.current_term() != descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                self.local_state.current_term()
            );
            return;
        }

        let retry_now = !matches!(update, PeerStateUpdate::OtherError);
        if !self.update_peer_state(&logger, descriptor.peer_id, descriptor.seq_no, update) {
            return;
        }

        self.advance_leader_commit_index();

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if retry_now {
            self.send_more_if_peer_is_behind(descriptor.peer_id, descriptor.term);
        }
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "SeqNo" => reply.seq_no));

        let update = match reply.result {
            Err(e) => {
                slog::warn!(logger, "InstallSnapshot failure: {}", e);
                PeerStateUpdate::OtherError
            }
            Ok(output) => {
                if self.step_down_if_term_increased(output.term) {
                    return;
                }
                PeerStateUpdate::SnapshotInstalled {
                    last_included_index: reply.last_included_index,
                }
            }
        };

        if self.local_state.current_term() != reply.term {
            return;
        }

        let retry_now = !matches!(update, PeerStateUpdate::OtherError);
        if !self.update_peer_state(&logger, reply.peer_id, reply.seq_no, update) {
            return;
        }

        self.advance_leader_commit_index();
        if retry_now {
            self.send_more_if_peer_is_behind(reply.peer_id, reply.term);
        }
    }

    /// Returns false if we're no longer leader.
    fn update_peer_state(
        &mut self,
        logger: &slog::Logger,
        peer_id: ReplicaId,
        seq_no: u64,
        update: PeerStateUpdate,
    ) -> bool {
        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::info!(logger, "No longer leader");
                return false;
            }
        };

        match leader_state.peer_state_mut(&peer_id) {
            Some(peer_state) => {
                peer_state.handle_append_entries_result(logger, seq_no, update);
                true
            }
            None => {
                slog::warn!(logger, "Peer {:?} not found while handling reply", peer_id);
                false
            }
        }
    }

    fn send_more_if_peer_is_behind(&mut self, peer_id: ReplicaId, term: Term) {
        let last_log_index = self.wal.last_index();
        let peer_is_behind = self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(&peer_id))
            .map(|peer_state| peer_state.next() <= last_log_index)
            .unwrap_or(false);

        if peer_is_behind {
            self.handle_leader_timer(LeaderTimerTick { peer_id, term });
        }
    }

    /// Where to retry a peer that rejected AppendEntries. If we have entries of the peer's
    /// conflicting term, resume right after our last one; otherwise skip the peer's whole term.
    fn next_index_after_conflict(&self, hint: ConflictHint) -> Index {
        match hint {
            ConflictHint::LogTooShort { next_index } => next_index,
            ConflictHint::TermMismatch { term, first_index } => match self.wal.last_index_of_term(term) {
                Some(last_index) => last_index.plus(1),
                None => first_index,
            },
        }
    }

    fn advance_leader_commit_index(&mut self) {
        // Our own last index counts towards the majority only once it's durable.
        if let Err(e) = self.persist_if(false) {
            slog::warn!(self.logger, "Not advancing commit index, state is not durable: {}", e);
            return;
        }

        let peers_matched_index: Vec<_> = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peers_iter().map(|peer_state| peer_state.matched()).collect(),
            None => return,
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        let tentative_new_commit_index = Self::get_cluster_commit_index(peers_matched_index, self.wal.last_index());
        if self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            slog::debug!(self.logger, "Commit index is now {:?}", tentative_new_commit_index);
            self.apply_signal.notify();
        }
    }

    /// The highest index replicated on a majority of the cluster, counting the leader at
    /// `leader_last_index`.
    fn get_cluster_commit_index(mut matched_indexes: Vec<Index>, leader_last_index: Index) -> Index {
        matched_indexes.push(leader_last_index);
        matched_indexes.sort();

        // Everything from this position to the end of the sorted list has replicated at least
        // this much, and that's exactly a majority of replicas.
        let quorum_idx = matched_indexes.len() - Self::get_majority_vote_count(matched_indexes.len());
        matched_indexes[quorum_idx]
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if we stepped down.
    fn step_down_if_term_increased(&mut self, observed_term: Term) -> bool {
        if !self.local_state.store_term_if_increased(observed_term) {
            return false;
        }

        self.election_state.transition_to_follower(observed_term, None);
        slog::info!(
            self.logger,
            "Observed increased term {:?} in reply. Transitioned to follower.",
            observed_term
        );
        if let Err(e) = self.persist() {
            slog::error!(self.logger, "Failed to persist term {:?}: {}", observed_term, e);
        }

        true
    }

    // ------- Outbound RPCs (run without the replica lock) --------

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer_client: Arc<dyn RaftTransport>,
        peer_id: ReplicaId,
        request: RequestVoteInput,
        callback: WeakReplicaHandle,
    ) {
        let term = request.candidate_term;
        slog::debug!(logger, "ClientWire - {:?}", request);
        let result = peer_client.request_vote(request).await;
        slog::debug!(logger, "ClientWire - {:?}", result);

        callback.notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result });
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer_client: Arc<dyn RaftTransport>,
        request: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
        callback: WeakReplicaHandle,
    ) {
        slog::debug!(
            logger,
            "ClientWire - AppendEntries prev: {:?}, entries: {}, commit: {:?}",
            request.leader_previous_log_entry,
            request.new_entries.len(),
            request.leader_commit_index
        );
        let result = peer_client.append_entries(request).await;
        slog::debug!(logger, "ClientWire - {:?}", result);

        callback.notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result });
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer_client: Arc<dyn RaftTransport>,
        peer_id: ReplicaId,
        seq_no: u64,
        request: InstallSnapshotInput,
        callback: WeakReplicaHandle,
    ) {
        let term = request.leader_term;
        let last_included_index = request.last_included_index;
        slog::debug!(logger, "ClientWire - InstallSnapshot through {:?}", last_included_index);
        let result = peer_client.install_snapshot(request).await;
        slog::debug!(logger, "ClientWire - {:?}", result);

        callback.notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
            peer_id,
            term,
            seq_no,
            last_included_index,
            result,
        });
    }

    // ------- Persistence --------

    /// Saves term, vote, log and snapshot together. Must succeed before anyone can observe what
    /// was saved.
    fn persist(&mut self) -> Result<(), PersistenceError> {
        let result = self.save_state();
        self.needs_persist = result.is_err();
        result
    }

    /// Saves if `changed`, or if an earlier save failed and hasn't been retried successfully.
    fn persist_if(&mut self, changed: bool) -> Result<(), PersistenceError> {
        if changed || self.needs_persist {
            self.persist()
        } else {
            Ok(())
        }
    }

    fn save_state(&self) -> Result<(), PersistenceError> {
        let entries = self.wal.retained_entries();
        let (current_term, voted_for) = self.local_state.voted_for_current_term();
        let snapshot = self.wal.snapshot();

        let raft_state = persistence::encode(PersistentStateRef {
            current_term,
            voted_for,
            last_included: snapshot.last_included(),
            entries: &entries,
        })?;
        self.persister.save(raft_state, snapshot.data.clone())?;

        Ok(())
    }
}

enum AppendOutcome {
    Appended { log_changed: bool },
    Rejected(Option<ConflictHint>),
}
