// Raft consensus node
// A synchronous, deterministic state machine per replica per partition. It
// never touches the network or the clock: the owner feeds it ticks and peer
// messages and drains outgoing messages, committed entries and ready reads.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use trellis_common::{CompactionMode, Index, NodeId, PartitionId, Result, Term, TrellisError};

use super::config::RaftConfig;
use super::log_store::LogStore;
use super::message::{Envelope, Message};
use super::types::{
    EntryPayload, LeaderState, LogEntry, Membership, RaftStatus, Role, Snapshot,
};

/// Single-server membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    AddReplica(NodeId),
    RemoveReplica(NodeId),
}

/// Outcome of a read-index request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub request_id: u64,
    /// Index the state machine must reach before the read may be served
    pub result: Result<Index>,
}

#[derive(Debug, Clone)]
struct Progress {
    next_index: Index,
    match_index: Index,
    read_ack: u64,
    recent_active: bool,
}

#[derive(Debug, Clone)]
struct PendingRead {
    ctx: u64,
    request_id: u64,
    index: Index,
}

/// Consensus state of one replica of one partition
pub struct RaftCore {
    id: NodeId,
    partition: PartitionId,
    config: RaftConfig,
    log: Box<dyn LogStore>,
    base_membership: Membership,
    membership: Membership,

    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    quorum_lost: bool,

    commit_index: Index,
    applied_index: Index,
    global_index: Index,
    pending_config: Option<Index>,
    progress: BTreeMap<NodeId, Progress>,

    clock: u64,
    election_elapsed: u64,
    heartbeat_elapsed: u64,
    randomized_timeout: u64,
    rng: StdRng,

    read_ctx: u64,
    pending_reads: VecDeque<PendingRead>,
    ready_reads: Vec<ReadState>,
    messages: Vec<Envelope>,
    installed_snapshot: Option<Snapshot>,
}

impl RaftCore {
    /// Build a core over `log`, recovering term, vote, membership and the
    /// applied position from it
    ///
    /// `membership` is the bootstrap voter set; a replica joining an existing
    /// partition passes an empty set and becomes a voter once it receives the
    /// configuration entry that adds it.
    pub fn new(
        id: NodeId,
        partition: PartitionId,
        membership: Membership,
        log: Box<dyn LogStore>,
        config: RaftConfig,
        seed: u64,
    ) -> Result<Self> {
        let hard_state = log.hard_state();
        let snapshot_index = log.snapshot().map(|s| s.index()).unwrap_or(0);
        let applied = snapshot_index.max(log.compacted_index());
        let clock = log
            .entry(log.last_index())
            .map(|e| e.timestamp)
            .or_else(|| log.snapshot().map(|s| s.meta.timestamp))
            .unwrap_or(0);

        let mut core = Self {
            id,
            partition,
            config,
            log,
            base_membership: membership.clone(),
            membership,
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            votes: BTreeSet::new(),
            quorum_lost: false,
            commit_index: applied,
            applied_index: applied,
            global_index: 0,
            pending_config: None,
            progress: BTreeMap::new(),
            clock,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_timeout: 0,
            rng: StdRng::seed_from_u64(seed),
            read_ctx: 0,
            pending_reads: VecDeque::new(),
            ready_reads: Vec::new(),
            messages: Vec::new(),
            installed_snapshot: None,
        };
        core.recompute_membership()?;
        core.reset_election_timer();
        Ok(core)
    }

    // ==================== Accessors ====================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader_state(&self) -> LeaderState {
        LeaderState {
            term: self.term,
            leader: self.leader,
        }
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn applied_index(&self) -> Index {
        self.applied_index
    }

    pub fn global_index(&self) -> Index {
        self.global_index
    }

    /// Logical clock in milliseconds, advanced by ticks and by the
    /// timestamps of replicated entries
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node: self.id,
            partition: self.partition,
            role: self.role,
            term: self.term,
            leader: self.leader,
            first_index: self.log.first_index(),
            last_index: self.log.last_index(),
            commit_index: self.commit_index,
            applied_index: self.applied_index,
            global_index: self.global_index,
            snapshot_index: self.log.snapshot().map(|s| s.index()).unwrap_or(0),
            voters: self.membership.voters.iter().copied().collect(),
        }
    }

    // ==================== Driving ====================

    /// Advance logical time by one tick
    pub fn tick(&mut self) -> Result<()> {
        self.clock += self.config.tick_interval_ms;
        self.election_elapsed += 1;

        if self.role == Role::Leader {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.config.heartbeat_ticks() {
                self.heartbeat_elapsed = 0;
                self.broadcast_append()?;
            }
            if self.election_elapsed >= self.config.election_timeout_ticks().0 {
                self.election_elapsed = 0;
                self.check_quorum()?;
            }
        } else if self.election_elapsed >= self.randomized_timeout
            && self.membership.contains(self.id)
        {
            self.campaign()?;
        }
        Ok(())
    }

    /// Start an election for the next term
    pub fn campaign(&mut self) -> Result<()> {
        if !self.membership.contains(self.id) {
            return Ok(());
        }
        self.term += 1;
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(self.id);
        self.log.save_hard_state(self.term, self.voted_for)?;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer();

        info!(
            "Partition {} node {} starting election for term {}",
            self.partition, self.id, self.term
        );
        metrics::counter!("trellis_raft_elections_total", "partition" => self.partition.to_string())
            .increment(1);

        if self.has_vote_quorum() {
            return self.become_leader();
        }
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            self.send(
                peer,
                Message::RequestVote {
                    term: self.term,
                    last_log_index,
                    last_log_term,
                },
            );
        }
        Ok(())
    }

    /// Process a message from a peer
    pub fn step(&mut self, from: NodeId, message: Message) -> Result<()> {
        // A replica removed from the partition must not disrupt it.
        if matches!(message, Message::RequestVote { .. })
            && !self.membership.is_empty()
            && !self.membership.contains(from)
        {
            debug!(
                "Partition {} ignoring vote request from non-member {}",
                self.partition, from
            );
            return Ok(());
        }

        let term = message.term();
        if term > self.term {
            let leader = message.is_from_leader().then_some(from);
            self.become_follower(term, leader)?;
        } else if term < self.term {
            self.reject_stale(from, &message);
            return Ok(());
        }

        match message {
            Message::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(from, last_log_index, last_log_term),
            Message::RequestVoteResponse { granted, .. } => {
                self.handle_vote_response(from, granted)
            }
            Message::AppendEntries {
                prev_index,
                prev_term,
                entries,
                leader_commit,
                global_index,
                read_ctx,
                ..
            } => self.handle_append_entries(
                from,
                prev_index,
                prev_term,
                entries,
                leader_commit,
                global_index,
                read_ctx,
            ),
            Message::AppendEntriesResponse {
                success,
                match_index,
                conflict_hint,
                read_ctx,
                ..
            } => self.handle_append_response(from, success, match_index, conflict_hint, read_ctx),
            Message::InstallSnapshot { snapshot, .. } => {
                self.handle_install_snapshot(from, snapshot)
            }
            Message::InstallSnapshotResponse { last_index, .. } => {
                self.handle_snapshot_response(from, last_index)
            }
        }
    }

    /// Append a command to the log; only the leader accepts proposals
    pub fn propose(&mut self, payload: Vec<u8>, compaction: CompactionMode) -> Result<Index> {
        self.ensure_leader()?;
        if payload.len() > self.config.max_entry_size {
            return Err(TrellisError::illegal_argument(format!(
                "entry of {} bytes exceeds the limit of {} bytes",
                payload.len(),
                self.config.max_entry_size
            )));
        }
        let index = self.append_entry(EntryPayload::Command(payload), compaction)?;
        self.broadcast_append()?;
        Ok(index)
    }

    /// Propose a single-server membership change
    pub fn change_membership(&mut self, change: MembershipChange) -> Result<Index> {
        self.ensure_leader()?;
        if self.pending_config.is_some() {
            return Err(TrellisError::illegal_argument(
                "a membership change is already in progress",
            ));
        }
        if self.log.term_at(self.commit_index) != Some(self.term) {
            return Err(TrellisError::illegal_argument(
                "leader has not committed an entry in its term yet",
            ));
        }
        let next = match change {
            MembershipChange::AddReplica(node) => self.membership.with_voter(node),
            MembershipChange::RemoveReplica(node) => self.membership.without_voter(node),
        };
        if next == self.membership {
            return Err(TrellisError::illegal_argument(format!(
                "membership change {:?} has no effect",
                change
            )));
        }
        if next.is_empty() {
            return Err(TrellisError::illegal_argument(
                "cannot remove the last voter",
            ));
        }

        info!(
            "Partition {} proposing membership change {:?}",
            self.partition, change
        );
        let index = self.append_entry(EntryPayload::Configuration(next), CompactionMode::Full)?;
        self.pending_config = Some(index);
        self.broadcast_append()?;
        Ok(index)
    }

    /// Request a linearizable read point
    ///
    /// The answer arrives through `take_ready_reads` once a majority has
    /// confirmed this replica is still the leader.
    pub fn read_index(&mut self, request_id: u64) -> Result<()> {
        self.ensure_leader()?;
        self.read_ctx += 1;
        self.pending_reads.push_back(PendingRead {
            ctx: self.read_ctx,
            request_id,
            index: self.commit_index,
        });
        self.broadcast_append()?;
        self.check_reads();
        Ok(())
    }

    /// Drop the log prefix up to `upto` and retain `snapshot`
    pub fn compact(&mut self, upto: Index, snapshot: Snapshot) -> Result<()> {
        self.log.compact(upto, snapshot)
    }

    /// Committed entries not handed out yet, in index order
    pub fn committed_entries(&mut self, max: usize) -> Result<Vec<LogEntry>> {
        if self.applied_index >= self.commit_index {
            return Ok(Vec::new());
        }
        let entries = self
            .log
            .entries(self.applied_index + 1, self.commit_index + 1, max)?;
        if let Some(last) = entries.last() {
            self.applied_index = last.index;
        }
        Ok(entries)
    }

    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.messages)
    }

    pub fn take_ready_reads(&mut self) -> Vec<ReadState> {
        std::mem::take(&mut self.ready_reads)
    }

    /// Snapshot received from the leader that the state machine must restore
    pub fn take_installed_snapshot(&mut self) -> Option<Snapshot> {
        self.installed_snapshot.take()
    }

    // ==================== Role transitions ====================

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.log.save_hard_state(self.term, None)?;
        }
        if self.role == Role::Leader {
            info!(
                "Partition {} node {} stepping down in term {}",
                self.partition, self.id, self.term
            );
            self.progress.clear();
            self.pending_config = None;
            for read in self.pending_reads.drain(..) {
                self.ready_reads.push(ReadState {
                    request_id: read.request_id,
                    result: Err(TrellisError::NotLeader {
                        leader_hint: leader,
                    }),
                });
            }
        }
        self.role = Role::Follower;
        self.leader = leader;
        if leader.is_some() {
            self.quorum_lost = false;
        }
        self.votes.clear();
        self.reset_election_timer();
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.quorum_lost = false;
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers()
            .map(|peer| {
                (
                    peer,
                    Progress {
                        next_index,
                        match_index: 0,
                        read_ack: 0,
                        recent_active: true,
                    },
                )
            })
            .collect();

        // A configuration entry inherited from the previous term is still in flight.
        let uncommitted = self.log.entries(
            self.commit_index + 1,
            self.log.last_index() + 1,
            usize::MAX,
        )?;
        self.pending_config = uncommitted
            .iter()
            .rev()
            .find(|e| matches!(e.payload, EntryPayload::Configuration(_)))
            .map(|e| e.index);

        info!(
            "Partition {} node {} became leader for term {}",
            self.partition, self.id, self.term
        );
        metrics::counter!("trellis_raft_leader_elected_total", "partition" => self.partition.to_string())
            .increment(1);

        self.append_entry(EntryPayload::TermStart, CompactionMode::Quorum)?;
        self.broadcast_append()
    }

    fn check_quorum(&mut self) -> Result<()> {
        let active = self
            .membership
            .voters
            .iter()
            .filter(|v| {
                **v == self.id
                    || self
                        .progress
                        .get(v)
                        .is_some_and(|p| p.recent_active)
            })
            .count();
        for progress in self.progress.values_mut() {
            progress.recent_active = false;
        }
        if active < self.membership.quorum() {
            warn!(
                "Partition {} leader {} lost contact with a quorum ({} of {} active), stepping down",
                self.partition,
                self.id,
                active,
                self.membership.len()
            );
            self.become_follower(self.term, None)?;
            self.quorum_lost = true;
        }
        Ok(())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role == Role::Leader {
            return Ok(());
        }
        if self.quorum_lost && self.leader.is_none() {
            return Err(TrellisError::NoQuorum);
        }
        Err(TrellisError::NotLeader {
            leader_hint: self.leader,
        })
    }

    // ==================== Election ====================

    fn handle_request_vote(
        &mut self,
        candidate: NodeId,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Result<()> {
        let can_vote = self.voted_for.is_none_or(|v| v == candidate);
        let my_last_term = self.log.last_term();
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.log.last_index());
        let granted = can_vote && up_to_date;

        if granted {
            self.voted_for = Some(candidate);
            self.log.save_hard_state(self.term, self.voted_for)?;
            self.reset_election_timer();
        }
        debug!(
            "Partition {} node {} vote for {} in term {}: {}",
            self.partition, self.id, candidate, self.term, granted
        );
        self.send(
            candidate,
            Message::RequestVoteResponse {
                term: self.term,
                granted,
            },
        );
        Ok(())
    }

    fn handle_vote_response(&mut self, from: NodeId, granted: bool) -> Result<()> {
        if self.role != Role::Candidate {
            return Ok(());
        }
        if granted {
            self.votes.insert(from);
        }
        if self.has_vote_quorum() {
            self.become_leader()?;
        }
        Ok(())
    }

    fn has_vote_quorum(&self) -> bool {
        let votes = self
            .votes
            .iter()
            .filter(|v| self.membership.contains(**v))
            .count();
        votes >= self.membership.quorum()
    }

    // ==================== Replication ====================

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        leader: NodeId,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
        global_index: Index,
        read_ctx: Option<u64>,
    ) -> Result<()> {
        if self.role != Role::Follower || self.leader != Some(leader) {
            self.become_follower(self.term, Some(leader))?;
        }
        self.election_elapsed = 0;

        let last_index = self.log.last_index();
        if prev_index > last_index {
            self.reject_append(leader, last_index, read_ctx);
            return Ok(());
        }

        // Entries at or below the compaction point are committed and therefore
        // identical to the leader's.
        let compacted = self.log.compacted_index();
        let (prev_index, entries) = if prev_index < compacted {
            let rest: Vec<LogEntry> = entries.into_iter().filter(|e| e.index > compacted).collect();
            (compacted, rest)
        } else {
            if self.log.term_at(prev_index) != Some(prev_term) {
                self.reject_append(leader, prev_index.saturating_sub(1), read_ctx);
                return Ok(());
            }
            (prev_index, entries)
        };

        let mut last_new = prev_index;
        let mut membership_touched = false;
        for (pos, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    last_new = entry.index;
                    continue;
                }
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(TrellisError::storage(format!(
                            "leader {} conflicts with committed entry {}",
                            leader, entry.index
                        )));
                    }
                    debug!(
                        "Partition {} truncating conflicting entries from {}",
                        self.partition, entry.index
                    );
                    self.log.truncate_from(entry.index)?;
                    membership_touched = true;
                }
                None => {}
            }
            let rest = &entries[pos..];
            self.log.append(rest)?;
            for appended in rest {
                self.clock = self.clock.max(appended.timestamp);
                if matches!(appended.payload, EntryPayload::Configuration(_)) {
                    membership_touched = true;
                }
            }
            last_new = rest.last().map(|e| e.index).unwrap_or(last_new);
            break;
        }
        if membership_touched {
            self.recompute_membership()?;
        }

        let commit = leader_commit.min(last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        self.global_index = self.global_index.max(global_index.min(self.commit_index));

        self.send(
            leader,
            Message::AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: last_new,
                conflict_hint: 0,
                read_ctx,
            },
        );
        Ok(())
    }

    fn reject_append(&mut self, leader: NodeId, conflict_hint: Index, read_ctx: Option<u64>) {
        self.send(
            leader,
            Message::AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_hint,
                read_ctx,
            },
        );
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        success: bool,
        match_index: Index,
        conflict_hint: Index,
        read_ctx: Option<u64>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        progress.recent_active = true;
        if let Some(ctx) = read_ctx {
            progress.read_ack = progress.read_ack.max(ctx);
        }

        if success {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let behind = progress.next_index <= last_index;
            self.maybe_commit()?;
            if behind {
                self.send_append(from)?;
            }
        } else {
            // Rewind and retry; a follower never stays behind forever.
            progress.next_index = (conflict_hint + 1)
                .min(progress.next_index.saturating_sub(1))
                .max(progress.match_index + 1)
                .max(1);
            self.send_append(from)?;
        }
        self.check_reads();
        Ok(())
    }

    fn handle_install_snapshot(&mut self, leader: NodeId, snapshot: Snapshot) -> Result<()> {
        if self.role != Role::Follower || self.leader != Some(leader) {
            self.become_follower(self.term, Some(leader))?;
        }
        self.election_elapsed = 0;

        let index = snapshot.index();
        if index <= self.commit_index {
            self.send(
                leader,
                Message::InstallSnapshotResponse {
                    term: self.term,
                    last_index: self.commit_index,
                },
            );
            return Ok(());
        }
        if let Err(e) = snapshot.verify() {
            warn!(
                "Partition {} rejecting snapshot from {}: {}",
                self.partition, leader, e
            );
            return Ok(());
        }

        info!(
            "Partition {} node {} installing snapshot at index {} from leader {}",
            self.partition, self.id, index, leader
        );
        self.clock = self.clock.max(snapshot.meta.timestamp);
        self.log.install_snapshot(snapshot.clone())?;
        self.commit_index = index;
        self.applied_index = index;
        self.recompute_membership()?;
        self.installed_snapshot = Some(snapshot);
        metrics::counter!("trellis_raft_snapshot_installs_total", "partition" => self.partition.to_string())
            .increment(1);

        self.send(
            leader,
            Message::InstallSnapshotResponse {
                term: self.term,
                last_index: index,
            },
        );
        Ok(())
    }

    fn handle_snapshot_response(&mut self, from: NodeId, last_index: Index) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let log_last = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        progress.recent_active = true;
        progress.match_index = progress.match_index.max(last_index);
        progress.next_index = progress.next_index.max(progress.match_index + 1);
        let behind = progress.next_index <= log_last;
        self.maybe_commit()?;
        if behind {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn broadcast_append(&mut self) -> Result<()> {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn send_append(&mut self, to: NodeId) -> Result<()> {
        let last_index = self.log.last_index();
        let read_ctx = self.pending_reads.back().map(|r| r.ctx);
        let Some(progress) = self.progress.get_mut(&to) else {
            return Ok(());
        };
        if progress.next_index > last_index + 1 {
            progress.next_index = last_index + 1;
        }
        let prev_index = progress.next_index - 1;

        let message = match self.log.term_at(prev_index) {
            Some(prev_term) => {
                let entries = self.log.entries(
                    progress.next_index,
                    last_index + 1,
                    self.config.max_payload_entries,
                )?;
                if let Some(last) = entries.last() {
                    progress.next_index = last.index + 1;
                }
                Message::AppendEntries {
                    term: self.term,
                    prev_index,
                    prev_term,
                    entries,
                    leader_commit: self.commit_index,
                    global_index: self.global_index,
                    read_ctx,
                }
            }
            None => {
                let Some(snapshot) = self.log.snapshot() else {
                    warn!(
                        "Partition {} cannot catch up node {}: index {} compacted without snapshot",
                        self.partition, to, prev_index
                    );
                    return Ok(());
                };
                debug!(
                    "Partition {} sending snapshot at index {} to node {}",
                    self.partition,
                    snapshot.index(),
                    to
                );
                progress.next_index = snapshot.index() + 1;
                Message::InstallSnapshot {
                    term: self.term,
                    snapshot: snapshot.clone(),
                }
            }
        };
        self.send(to, message);
        Ok(())
    }

    fn maybe_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let mut matched: Vec<Index> = self
            .membership
            .voters
            .iter()
            .map(|v| self.match_index_of(*v))
            .collect();
        let quorum = self.membership.quorum();
        if matched.len() < quorum {
            return Ok(());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[quorum - 1];

        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.term) {
            self.commit_index = candidate;
            debug!(
                "Partition {} commit index advanced to {}",
                self.partition, candidate
            );
            self.update_global_index();
            // Let followers learn the new commit index without waiting for a heartbeat.
            self.broadcast_append()?;

            if self.pending_config.is_some_and(|index| index <= candidate) {
                self.pending_config = None;
                if !self.membership.contains(self.id) {
                    info!(
                        "Partition {} node {} removed from membership, stepping down",
                        self.partition, self.id
                    );
                    return self.become_follower(self.term, None);
                }
            }
        }
        self.update_global_index();
        self.check_reads();
        Ok(())
    }

    fn update_global_index(&mut self) {
        let lowest = self
            .membership
            .voters
            .iter()
            .map(|v| self.match_index_of(*v))
            .min()
            .unwrap_or(0);
        self.global_index = self.global_index.max(lowest.min(self.commit_index));
    }

    fn match_index_of(&self, node: NodeId) -> Index {
        if node == self.id {
            self.log.last_index()
        } else {
            self.progress.get(&node).map(|p| p.match_index).unwrap_or(0)
        }
    }

    fn check_reads(&mut self) {
        if self.role != Role::Leader || self.pending_reads.is_empty() {
            return;
        }
        // Reads wait until this term's first entry is committed.
        if self.log.term_at(self.commit_index) != Some(self.term) {
            return;
        }
        let quorum = self.membership.quorum();
        while let Some(read) = self.pending_reads.front() {
            let acks = self
                .membership
                .voters
                .iter()
                .filter(|v| {
                    **v == self.id
                        || self
                            .progress
                            .get(v)
                            .is_some_and(|p| p.read_ack >= read.ctx)
                })
                .count();
            if acks < quorum {
                break;
            }
            let index = read.index.max(self.commit_index);
            let request_id = read.request_id;
            self.pending_reads.pop_front();
            self.ready_reads.push(ReadState {
                request_id,
                result: Ok(index),
            });
        }
    }

    // ==================== Log helpers ====================

    fn append_entry(&mut self, payload: EntryPayload, compaction: CompactionMode) -> Result<Index> {
        let index = self.log.last_index() + 1;
        let is_config = matches!(payload, EntryPayload::Configuration(_));
        let entry = LogEntry {
            index,
            term: self.term,
            timestamp: self.clock,
            compaction,
            payload,
        };
        self.log.append(std::slice::from_ref(&entry))?;
        if is_config {
            self.recompute_membership()?;
        }
        metrics::counter!("trellis_raft_proposals_total", "partition" => self.partition.to_string())
            .increment(1);
        self.maybe_commit()?;
        Ok(index)
    }

    /// Membership is the latest configuration in the log, falling back to the
    /// snapshot's and then to the bootstrap set
    fn recompute_membership(&mut self) -> Result<()> {
        let mut membership = self
            .log
            .snapshot()
            .map(|s| s.meta.membership.clone())
            .unwrap_or_else(|| self.base_membership.clone());
        let entries =
            self.log
                .entries(self.log.first_index(), self.log.last_index() + 1, usize::MAX)?;
        for entry in entries {
            if let EntryPayload::Configuration(config) = entry.payload {
                membership = config;
            }
        }
        if membership != self.membership {
            info!(
                "Partition {} node {} membership is now {:?}",
                self.partition, self.id, membership.voters
            );
        }
        self.membership = membership;

        if self.role == Role::Leader {
            let id = self.id;
            let next_index = self.log.last_index() + 1;
            let voters = self.membership.voters.clone();
            self.progress.retain(|node, _| voters.contains(node));
            for peer in voters.into_iter().filter(|v| *v != id) {
                self.progress.entry(peer).or_insert(Progress {
                    next_index,
                    match_index: 0,
                    read_ack: 0,
                    recent_active: true,
                });
            }
        }
        Ok(())
    }

    fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.membership
            .voters
            .iter()
            .copied()
            .filter(move |v| *v != self.id)
    }

    fn reset_election_timer(&mut self) {
        let (min, max) = self.config.election_timeout_ticks();
        self.election_elapsed = 0;
        self.randomized_timeout = self.rng.random_range(min..=max);
    }

    fn reject_stale(&mut self, from: NodeId, message: &Message) {
        match message {
            Message::RequestVote { .. } => self.send(
                from,
                Message::RequestVoteResponse {
                    term: self.term,
                    granted: false,
                },
            ),
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                self.reject_append(from, self.log.last_index(), None)
            }
            _ => {}
        }
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.messages.push(Envelope {
            partition: self.partition,
            from: self.id,
            to,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::raft::log_store::MemoryLogStore;

    fn test_config() -> RaftConfig {
        RaftConfig {
            tick_interval_ms: 10,
            election_timeout_ms: 100,
            heartbeat_interval_ms: 30,
            ..Default::default()
        }
    }

    fn core(id: NodeId, voters: &[NodeId]) -> RaftCore {
        RaftCore::new(
            id,
            0,
            Membership::new(voters.iter().copied()),
            Box::new(MemoryLogStore::new()),
            test_config(),
            id,
        )
        .unwrap()
    }

    /// In-process network that delivers messages synchronously
    struct Network {
        nodes: BTreeMap<NodeId, RaftCore>,
        isolated: HashSet<NodeId>,
    }

    impl Network {
        fn new(size: u64) -> Self {
            let voters: Vec<NodeId> = (1..=size).collect();
            let nodes = voters.iter().map(|id| (*id, core(*id, &voters))).collect();
            Self {
                nodes,
                isolated: HashSet::new(),
            }
        }

        fn node(&mut self, id: NodeId) -> &mut RaftCore {
            self.nodes.get_mut(&id).unwrap()
        }

        fn deliver(&mut self) {
            for _ in 0..1000 {
                let mut pending = Vec::new();
                for node in self.nodes.values_mut() {
                    pending.extend(node.take_messages());
                }
                if pending.is_empty() {
                    return;
                }
                for envelope in pending {
                    if self.isolated.contains(&envelope.from) || self.isolated.contains(&envelope.to)
                    {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&envelope.to) {
                        node.step(envelope.from, envelope.message).unwrap();
                    }
                }
            }
            panic!("network did not quiesce");
        }

        fn elect(&mut self, id: NodeId) {
            self.node(id).campaign().unwrap();
            self.deliver();
            assert!(self.node(id).is_leader());
        }

        fn tick_all(&mut self, ticks: usize) {
            for _ in 0..ticks {
                for node in self.nodes.values_mut() {
                    node.tick().unwrap();
                }
                self.deliver();
            }
        }

        fn drain_committed(&mut self, id: NodeId) -> Vec<LogEntry> {
            self.node(id).committed_entries(usize::MAX).unwrap()
        }

        /// Note every current leader, failing if a term already has another one
        fn record_leaders(&self, leaders: &mut BTreeMap<Term, NodeId>) {
            for (id, node) in &self.nodes {
                if !node.is_leader() {
                    continue;
                }
                let previous = *leaders.entry(node.term()).or_insert(*id);
                assert_eq!(previous, *id, "two leaders in term {}", node.term());
            }
        }

        fn propose_on_leaders(&mut self, payload: u8) {
            for node in self.nodes.values_mut() {
                if node.is_leader() {
                    node.propose(vec![payload], CompactionMode::Quorum).unwrap();
                }
            }
            self.deliver();
        }
    }

    #[test]
    fn test_single_node_commits_immediately() {
        let mut node = core(1, &[1]);
        node.campaign().unwrap();
        assert!(node.is_leader());
        assert_eq!(node.commit_index(), 1);

        let index = node.propose(b"cmd".to_vec(), CompactionMode::Quorum).unwrap();
        assert_eq!(index, 2);
        assert_eq!(node.commit_index(), 2);

        let entries = node.committed_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, EntryPayload::TermStart);
    }

    #[test]
    fn test_election_and_term_start_commit() {
        let mut net = Network::new(3);
        net.elect(1);

        for id in 1..=3 {
            let node = net.node(id);
            assert_eq!(node.term(), 1);
            assert_eq!(node.leader(), Some(1));
            assert_eq!(node.commit_index(), 1);
        }
        assert_eq!(net.node(2).role(), Role::Follower);
    }

    #[test]
    fn test_vote_at_most_once_per_term() {
        let mut voter = core(3, &[1, 2, 3]);
        let request = |term| Message::RequestVote {
            term,
            last_log_index: 0,
            last_log_term: 0,
        };

        voter.step(1, request(1)).unwrap();
        voter.step(2, request(1)).unwrap();
        let grants: Vec<(NodeId, bool)> = voter
            .take_messages()
            .into_iter()
            .map(|e| match e.message {
                Message::RequestVoteResponse { granted, .. } => (e.to, granted),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(grants, vec![(1, true), (2, false)]);
    }

    #[test]
    fn test_stale_log_candidate_is_rejected() {
        let mut net = Network::new(3);
        net.elect(1);
        net.node(1).propose(b"x".to_vec(), CompactionMode::Quorum).unwrap();
        net.deliver();

        let message = Message::RequestVote {
            term: 5,
            last_log_index: 1,
            last_log_term: 1,
        };
        net.node(2).step(4, message).unwrap();
        let response = net.node(2).take_messages();
        assert!(response.is_empty(), "non-member vote requests are ignored");

        let message = Message::RequestVote {
            term: 5,
            last_log_index: 1,
            last_log_term: 1,
        };
        net.node(2).step(3, message).unwrap();
        let response = net.node(2).take_messages().pop().unwrap();
        assert_eq!(
            response.message,
            Message::RequestVoteResponse {
                term: 5,
                granted: false
            }
        );
    }

    #[test]
    fn test_replication_reaches_all_followers() {
        let mut net = Network::new(3);
        net.elect(1);
        for i in 0..5u8 {
            net.node(1).propose(vec![i], CompactionMode::Quorum).unwrap();
        }
        net.deliver();

        for id in 1..=3 {
            assert_eq!(net.node(id).commit_index(), 6);
            let entries = net.drain_committed(id);
            assert_eq!(entries.len(), 6);
            assert_eq!(entries[5].payload, EntryPayload::Command(vec![4]));
        }
    }

    #[test]
    fn test_entry_timestamps_are_monotonic() {
        let mut net = Network::new(3);
        net.elect(1);
        net.node(1).propose(vec![1], CompactionMode::Quorum).unwrap();
        net.tick_all(5);
        net.node(1).propose(vec![2], CompactionMode::Quorum).unwrap();
        net.deliver();

        let entries = net.drain_committed(2);
        for pair in entries.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert!(entries.last().unwrap().timestamp >= 50);
    }

    #[test]
    fn test_divergent_entries_are_replaced() {
        let mut net = Network::new(3);
        net.elect(1);
        net.node(1).propose(vec![1], CompactionMode::Quorum).unwrap();
        net.deliver();

        // The old leader keeps accepting proposals it can never commit.
        net.isolated.insert(1);
        net.node(1).propose(vec![9], CompactionMode::Quorum).unwrap();
        net.node(1).propose(vec![9], CompactionMode::Quorum).unwrap();
        net.deliver();

        net.elect(2);
        net.node(2).propose(vec![2], CompactionMode::Quorum).unwrap();
        net.deliver();

        net.isolated.clear();
        net.tick_all(5);

        assert_eq!(net.node(1).leader(), Some(2));
        let last = net.node(2).log().last_index();
        for id in 1..=3 {
            assert_eq!(net.node(id).log().last_index(), last);
            assert_eq!(net.node(id).commit_index(), last);
            assert_eq!(
                net.node(id).log().entry(last).unwrap().payload,
                EntryPayload::Command(vec![2])
            );
        }
        assert!(net
            .drain_committed(1)
            .iter()
            .all(|e| e.payload != EntryPayload::Command(vec![9])));
    }

    #[test]
    fn test_proposal_on_follower_returns_hint() {
        let mut net = Network::new(3);
        net.elect(1);
        let result = net.node(2).propose(vec![1], CompactionMode::Quorum);
        assert_eq!(
            result,
            Err(TrellisError::NotLeader {
                leader_hint: Some(1)
            })
        );
    }

    #[test]
    fn test_read_index_confirms_leadership() {
        let mut net = Network::new(3);
        net.elect(1);
        net.node(1).propose(vec![1], CompactionMode::Quorum).unwrap();
        net.deliver();

        net.node(1).read_index(7).unwrap();
        assert!(net.node(1).take_ready_reads().is_empty());
        net.deliver();

        let reads = net.node(1).take_ready_reads();
        assert_eq!(
            reads,
            vec![ReadState {
                request_id: 7,
                result: Ok(2)
            }]
        );
    }

    #[test]
    fn test_read_index_needs_a_quorum() {
        let mut net = Network::new(3);
        net.elect(1);
        net.isolated.insert(2);
        net.isolated.insert(3);

        net.node(1).read_index(1).unwrap();
        net.deliver();
        assert!(net.node(1).take_ready_reads().is_empty());

        net.isolated.clear();
        net.tick_all(3);
        assert_eq!(net.node(1).take_ready_reads().len(), 1);
    }

    #[test]
    fn test_isolated_leader_fails_fast_with_no_quorum() {
        let mut net = Network::new(3);
        net.elect(1);
        net.isolated.insert(1);

        // Two election timeouts: the first resets activity flags, the second
        // observes a silent majority.
        for _ in 0..25 {
            net.node(1).tick().unwrap();
            net.deliver();
        }
        assert!(!net.node(1).is_leader());
        assert_eq!(
            net.node(1).propose(vec![1], CompactionMode::Quorum),
            Err(TrellisError::NoQuorum)
        );
    }

    #[test]
    fn test_randomized_election_timeout_within_bounds() {
        let mut node = core(1, &[1, 2, 3]);
        let (min, max) = node.config.election_timeout_ticks();
        let mut ticks = 0;
        while node.role() == Role::Follower {
            node.tick().unwrap();
            ticks += 1;
        }
        assert_eq!(node.role(), Role::Candidate);
        assert!(ticks >= min && ticks <= max, "ticks {}", ticks);
        assert_eq!(node.take_messages().len(), 2);
    }

    #[test]
    fn test_lagging_follower_receives_snapshot() {
        let mut net = Network::new(3);
        net.elect(1);
        net.isolated.insert(3);
        for i in 0..10u8 {
            net.node(1).propose(vec![i], CompactionMode::Quorum).unwrap();
        }
        net.deliver();
        assert_eq!(net.node(1).commit_index(), 11);

        let leader = net.node(1);
        let snapshot = Snapshot::new(
            11,
            1,
            leader.clock(),
            leader.membership().clone(),
            b"state".to_vec(),
        );
        leader.compact(11, snapshot).unwrap();
        assert_eq!(leader.log().first_index(), 12);

        net.isolated.clear();
        net.tick_all(5);

        let follower = net.node(3);
        assert_eq!(follower.commit_index(), 11);
        assert_eq!(follower.log().compacted_index(), 11);
        let installed = follower.take_installed_snapshot().unwrap();
        assert_eq!(installed.data, b"state".to_vec());
        assert!(follower.committed_entries(10).unwrap().is_empty());
    }

    #[test]
    fn test_add_replica_through_configuration_entry() {
        let mut net = Network::new(3);
        net.elect(1);
        net.nodes.insert(4, core(4, &[]));

        let index = net
            .node(1)
            .change_membership(MembershipChange::AddReplica(4))
            .unwrap();
        assert_eq!(
            net.node(1).change_membership(MembershipChange::AddReplica(5)),
            Err(TrellisError::illegal_argument(
                "a membership change is already in progress"
            ))
        );
        net.deliver();

        assert!(net.node(1).commit_index() >= index);
        let joined = net.node(4);
        assert!(joined.membership().contains(4));
        assert_eq!(joined.log().last_index(), index);
        assert_eq!(net.node(1).membership().quorum(), 3);
    }

    #[test]
    fn test_removed_leader_steps_down() {
        let mut net = Network::new(3);
        net.elect(1);
        net.node(1)
            .change_membership(MembershipChange::RemoveReplica(1))
            .unwrap();
        net.deliver();

        assert!(!net.node(1).is_leader());
        assert!(!net.node(2).membership().contains(1));

        // The removed replica never campaigns again.
        for _ in 0..50 {
            net.node(1).tick().unwrap();
        }
        assert_eq!(net.node(1).role(), Role::Follower);
    }

    #[test]
    fn test_global_index_tracks_slowest_voter() {
        let mut net = Network::new(3);
        net.elect(1);
        net.isolated.insert(3);
        net.node(1).propose(vec![1], CompactionMode::Full).unwrap();
        net.deliver();

        assert_eq!(net.node(1).commit_index(), 2);
        assert_eq!(net.node(1).global_index(), 1);

        net.isolated.clear();
        net.tick_all(6);
        assert_eq!(net.node(1).global_index(), 2);
        assert_eq!(net.node(2).global_index(), 2);
    }

    #[test]
    fn test_one_leader_per_term_across_partitions() {
        let mut net = Network::new(5);
        net.elect(1);
        let mut leaders = BTreeMap::new();

        for cycle in 0..20u8 {
            // Cut off the current leader and one more replica; three remain.
            let leader = net.nodes.values().find(|n| n.is_leader()).map(|n| n.id);
            net.isolated.extend(leader);
            net.isolated.insert(u64::from(cycle % 5) + 1);
            net.propose_on_leaders(cycle);

            for tick in 0..60 {
                net.tick_all(1);
                net.record_leaders(&mut leaders);
                if tick % 15 == 0 {
                    net.propose_on_leaders(cycle);
                }
            }

            net.isolated.clear();
            for _ in 0..60 {
                net.tick_all(1);
                net.record_leaders(&mut leaders);
            }
        }
        assert!(leaders.len() > 1, "leadership never moved: {:?}", leaders);

        // Log matching: the same index and term always hold the same entry
        let ids: Vec<NodeId> = net.nodes.keys().copied().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let (left, right) = (&net.nodes[a], &net.nodes[b]);
                let last = left.log().last_index().min(right.log().last_index());
                for index in 1..=last {
                    let (x, y) = (left.log().entry(index), right.log().entry(index));
                    if let (Some(x), Some(y)) = (x, y) {
                        if x.term == y.term {
                            assert_eq!(x, y, "nodes {} and {} differ at index {}", a, b, index);
                        }
                    }
                }
            }
        }
    }
}
