// Partition server
// One actor per replica per partition. It owns the consensus core, the state
// machine and the compaction controller, and is the only task that touches
// them, so entries are applied single-threaded in commit order while
// different partitions run fully in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use trellis_common::{
    CompactionMode, Consistency, Index, NodeId, PartitionId, Result, SessionId, Term,
    TrellisError,
};

use super::command::{LogCommand, Operation, Request, Response};
use super::state_machine::{ApplyResponse, PartitionStateMachine};
use crate::cluster::Transport;
use crate::compaction::{CompactionConfig, CompactionController, CompactionInputs};
use crate::raft::{
    Envelope, LeaderState, LogStore, Membership, MembershipChange, RaftConfig, RaftCore, Snapshot,
};
use crate::service::ServiceRegistry;
use crate::session::{SequenceCheck, SessionConfig};

/// Request together with the channel its answer goes to
#[derive(Debug)]
pub struct PartitionCall {
    pub request: Request,
    pub respond_to: oneshot::Sender<Result<Response>>,
}

/// Everything partition servers of one node share
#[derive(Clone)]
pub struct ServerContext {
    pub raft: RaftConfig,
    pub session: SessionConfig,
    pub compaction: CompactionConfig,
    pub registry: Arc<ServiceRegistry>,
    pub transport: Arc<dyn Transport>,
}

/// Cloneable handle for sending requests to a running partition server
#[derive(Clone, Debug)]
pub struct PartitionHandle {
    node: NodeId,
    partition: PartitionId,
    tx: mpsc::UnboundedSender<PartitionCall>,
    leader: watch::Receiver<LeaderState>,
    timeout: Duration,
}

impl PartitionHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Leadership as last published by the server
    pub fn leader_state(&self) -> LeaderState {
        *self.leader.borrow()
    }

    pub fn subscribe_leader(&self) -> watch::Receiver<LeaderState> {
        self.leader.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a request and wait for its answer
    ///
    /// Giving up on the answer never retracts a command that was already
    /// proposed; its outcome is unknown and a retry with the same sequence
    /// number is answered from the session cache.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(PartitionCall {
                request,
                respond_to,
            })
            .map_err(|_| TrellisError::Shutdown)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TrellisError::Shutdown),
            Err(_) => Err(TrellisError::Timeout),
        }
    }
}

struct Waiter {
    /// Term the entry was proposed in; a different term at apply time means
    /// the entry was replaced by another leader
    term: Term,
    respond_to: oneshot::Sender<Result<Response>>,
}

struct PendingQuery {
    session: SessionId,
    operation: Operation,
    /// Applied index the state machine must reach first
    min_index: Index,
    respond_to: oneshot::Sender<Result<Response>>,
}

/// Single replica of one partition
pub struct PartitionServer {
    node: NodeId,
    partition: PartitionId,
    core: RaftCore,
    state_machine: PartitionStateMachine,
    compaction: CompactionController,
    session_config: SessionConfig,
    transport: Arc<dyn Transport>,
    calls: mpsc::UnboundedReceiver<PartitionCall>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    leader_tx: watch::Sender<LeaderState>,
    apply_batch: usize,
    tick_interval: Duration,
    ticks: u64,

    waiters: BTreeMap<Index, Vec<Waiter>>,
    /// Commands proposed but not yet applied, by (session, seq)
    inflight: HashMap<(SessionId, u64), Index>,
    /// Linearizable reads waiting for leadership confirmation
    confirming: HashMap<u64, PendingQuery>,
    /// Reads waiting for the state machine to catch up
    queries: Vec<PendingQuery>,
    /// Sessions with an expiry proposal in flight, by proposal index
    expiring: BTreeMap<SessionId, Index>,
    next_read_id: u64,
    was_leader: bool,
}

impl PartitionServer {
    /// Build the server over `log`, restoring the retained snapshot
    pub fn new(
        node: NodeId,
        partition: PartitionId,
        membership: Membership,
        log: Box<dyn LogStore>,
        ctx: &ServerContext,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<(Self, PartitionHandle)> {
        let mut state_machine = PartitionStateMachine::new(partition, ctx.registry.clone());
        if let Some(snapshot) = log.snapshot() {
            snapshot.verify()?;
            state_machine.restore(&snapshot.data)?;
            state_machine.release_retained(log.compacted_index());
        }

        let seed = node.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(partition);
        let core = RaftCore::new(node, partition, membership, log, ctx.raft.clone(), seed)?;
        let (tx, calls) = mpsc::unbounded_channel();
        let (leader_tx, leader_rx) = watch::channel(core.leader_state());

        let handle = PartitionHandle {
            node,
            partition,
            tx,
            leader: leader_rx,
            timeout: ctx.raft.rpc_timeout(),
        };
        let server = Self {
            node,
            partition,
            core,
            state_machine,
            compaction: CompactionController::new(partition, ctx.compaction.clone()),
            session_config: ctx.session.clone(),
            transport: ctx.transport.clone(),
            calls,
            inbox,
            leader_tx,
            apply_batch: ctx.raft.max_payload_entries.max(1),
            tick_interval: ctx.raft.tick_interval(),
            ticks: 0,
            waiters: BTreeMap::new(),
            inflight: HashMap::new(),
            confirming: HashMap::new(),
            queries: Vec::new(),
            expiring: BTreeMap::new(),
            next_read_id: 0,
            was_leader: false,
        };
        Ok((server, handle))
    }

    /// Run the server loop until shutdown or a fatal storage error
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Partition {} server started on node {}",
            self.partition, self.node
        );
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expiry = interval(self.session_config.expiry_check_interval());
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut compaction = interval(self.compaction.config().check_interval());
        compaction.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let result = tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.core.step(envelope.from, envelope.message),
                    None => break,
                },
                call = self.calls.recv() => match call {
                    Some(call) => {
                        self.handle_call(call);
                        Ok(())
                    }
                    None => break,
                },
                _ = expiry.tick() => self.check_sessions(),
                _ = compaction.tick() => self.maybe_compact(),
                _ = shutdown.recv() => break,
            };

            if let Err(e) = result.and_then(|_| self.drive()) {
                if e.is_fatal() {
                    error!(
                        "Partition {} server on node {} stopping: {}",
                        self.partition, self.node, e
                    );
                    break;
                }
                warn!(
                    "Partition {} server on node {}: {}",
                    self.partition, self.node, e
                );
            }
        }

        self.leader_tx.send_replace(LeaderState {
            term: self.core.term(),
            leader: None,
        });
        info!(
            "Partition {} server stopped on node {}",
            self.partition, self.node
        );
    }

    // ==================== Requests ====================

    fn handle_call(&mut self, call: PartitionCall) {
        let PartitionCall {
            request,
            respond_to,
        } = call;
        debug!(
            "Partition {} node {} handling {} request",
            self.partition,
            self.node,
            request.kind()
        );
        match request {
            Request::OpenSession { client, timeout_ms } => {
                self.propose_command(
                    LogCommand::OpenSession { client, timeout_ms },
                    CompactionMode::Quorum,
                    respond_to,
                );
            }
            Request::KeepAlive {
                session,
                command_ack,
            } => {
                self.propose_command(
                    LogCommand::KeepAlive {
                        session,
                        command_ack,
                    },
                    CompactionMode::Quorum,
                    respond_to,
                );
            }
            Request::CloseSession { session } => {
                self.propose_command(
                    LogCommand::CloseSession { session },
                    CompactionMode::Quorum,
                    respond_to,
                );
            }
            Request::Execute {
                session,
                seq,
                ack,
                operation,
                compaction,
            } => self.execute(session, seq, ack, operation, compaction, respond_to),
            Request::Query {
                session,
                operation,
                consistency,
                observed_index,
            } => self.query(session, operation, consistency, observed_index, respond_to),
            Request::AddReplica { node } => {
                self.change_membership(MembershipChange::AddReplica(node), respond_to)
            }
            Request::RemoveReplica { node } => {
                self.change_membership(MembershipChange::RemoveReplica(node), respond_to)
            }
            Request::Status => {
                let _ = respond_to.send(Ok(Response::Status(self.core.status())));
            }
        }
    }

    fn execute(
        &mut self,
        session: SessionId,
        seq: u64,
        ack: u64,
        operation: Operation,
        compaction: CompactionMode,
        respond_to: oneshot::Sender<Result<Response>>,
    ) {
        if !self.core.is_leader() {
            let _ = respond_to.send(Err(self.not_leader()));
            return;
        }

        // Already applied: answer from the session cache without a new entry.
        if let Ok(SequenceCheck::Duplicate(cached)) =
            self.state_machine.sessions().check_sequence(session, seq)
        {
            metrics::counter!("trellis_duplicate_commands_total", "partition" => self.partition.to_string())
                .increment(1);
            let _ = respond_to.send(cached.result.map(|result| Response::Output {
                index: cached.index,
                result,
            }));
            return;
        }

        // Proposed but not applied yet: wait on the same entry.
        if let Some(index) = self.inflight.get(&(session, seq)).copied() {
            self.waiters.entry(index).or_default().push(Waiter {
                term: self.core.term(),
                respond_to,
            });
            return;
        }

        let command = LogCommand::Command {
            session,
            seq,
            ack,
            operation,
        };
        if let Some(index) = self.propose_command(command, compaction, respond_to) {
            self.inflight.insert((session, seq), index);
            metrics::counter!("trellis_proposals_total", "partition" => self.partition.to_string())
                .increment(1);
        }
    }

    fn query(
        &mut self,
        session: SessionId,
        operation: Operation,
        consistency: Consistency,
        observed_index: Index,
        respond_to: oneshot::Sender<Result<Response>>,
    ) {
        match consistency {
            Consistency::Linearizable => {
                self.next_read_id += 1;
                let id = self.next_read_id;
                match self.core.read_index(id) {
                    Ok(()) => {
                        self.confirming.insert(
                            id,
                            PendingQuery {
                                session,
                                operation,
                                min_index: 0,
                                respond_to,
                            },
                        );
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            // Any replica may answer once it has caught up with the caller.
            Consistency::Sequential | Consistency::Causal => self.queries.push(PendingQuery {
                session,
                operation,
                min_index: observed_index,
                respond_to,
            }),
        }
    }

    fn change_membership(
        &mut self,
        change: MembershipChange,
        respond_to: oneshot::Sender<Result<Response>>,
    ) {
        match self.core.change_membership(change) {
            Ok(index) => self.wait_for(index, respond_to),
            Err(e) => {
                let _ = respond_to.send(Err(e));
            }
        }
    }

    /// Append a log command and register `respond_to` for its outcome
    fn propose_command(
        &mut self,
        command: LogCommand,
        compaction: CompactionMode,
        respond_to: oneshot::Sender<Result<Response>>,
    ) -> Option<Index> {
        let proposed = command
            .encode()
            .and_then(|payload| self.core.propose(payload, compaction));
        match proposed {
            Ok(index) => {
                self.wait_for(index, respond_to);
                Some(index)
            }
            Err(e) => {
                debug!(
                    "Partition {} rejected {} proposal: {}",
                    self.partition,
                    command.kind(),
                    e
                );
                let _ = respond_to.send(Err(e));
                None
            }
        }
    }

    fn wait_for(&mut self, index: Index, respond_to: oneshot::Sender<Result<Response>>) {
        self.waiters.entry(index).or_default().push(Waiter {
            term: self.core.term(),
            respond_to,
        });
    }

    fn not_leader(&self) -> TrellisError {
        TrellisError::NotLeader {
            leader_hint: self.core.leader().filter(|leader| *leader != self.node),
        }
    }

    // ==================== Periodic work ====================

    fn on_tick(&mut self) -> Result<()> {
        self.core.tick()?;
        self.ticks += 1;
        // Stop tracking callers that gave up.
        for waiters in self.waiters.values_mut() {
            waiters.retain(|w| !w.respond_to.is_closed());
        }
        self.waiters.retain(|_, waiters| !waiters.is_empty());
        self.queries.retain(|q| !q.respond_to.is_closed());
        if self.ticks % 20 == 0 {
            self.publish_gauges();
        }
        Ok(())
    }

    /// Propose expiry of sessions that missed their keep-alive deadline
    fn check_sessions(&mut self) -> Result<()> {
        if !self.core.is_leader() {
            return Ok(());
        }
        let now = self.core.clock();
        for session in self.state_machine.sessions().stale_sessions(now) {
            if self.expiring.contains_key(&session) {
                continue;
            }
            let payload = LogCommand::ExpireSession { session }.encode()?;
            match self.core.propose(payload, CompactionMode::Sequential) {
                Ok(index) => {
                    info!(
                        "Partition {} proposing expiry of session {} at index {}",
                        self.partition, session, index
                    );
                    self.expiring.insert(session, index);
                }
                Err(e) if e.is_retriable() => {
                    debug!(
                        "Partition {} cannot expire session {} now: {}",
                        self.partition, session, e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Snapshot the applied state and drop the eligible log prefix
    fn maybe_compact(&mut self) -> Result<()> {
        let log = self.core.log();
        if !self.compaction.should_compact(log.len() as u64) {
            return Ok(());
        }
        let snapshot_index = self.state_machine.applied_index();
        let inputs = CompactionInputs {
            snapshot_index,
            commit_index: self.core.commit_index(),
            global_index: self.core.global_index(),
            retention_floor: self.state_machine.sessions().retention_floor(),
            compacted_index: log.compacted_index(),
        };
        let plan = self.compaction.plan(&inputs, self.state_machine.retained());
        if !plan.makes_progress(&inputs) {
            return Ok(());
        }

        let term = log
            .term_at(snapshot_index)
            .ok_or(TrellisError::Compacted {
                index: snapshot_index,
            })?;
        let snapshot = Snapshot::new(
            snapshot_index,
            term,
            self.state_machine.last_timestamp(),
            self.core.membership().clone(),
            self.state_machine.snapshot()?,
        );
        let before = log.len();
        self.core.compact(plan.upto, snapshot)?;
        self.state_machine.release_retained(plan.upto);

        info!(
            "Partition {} node {} compacted log up to {} (snapshot at {}, {} entries dropped)",
            self.partition,
            self.node,
            plan.upto,
            snapshot_index,
            before.saturating_sub(self.core.log().len())
        );
        metrics::counter!("trellis_compactions_total", "partition" => self.partition.to_string())
            .increment(1);
        Ok(())
    }

    // ==================== Ready processing ====================

    /// Push everything the core produced to its destination
    fn drive(&mut self) -> Result<()> {
        if let Some(snapshot) = self.core.take_installed_snapshot() {
            self.restore_snapshot(&snapshot)?;
        }

        loop {
            let entries = self.core.committed_entries(self.apply_batch)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let outcome = self.state_machine.apply(&entry);
                self.complete(entry.index, entry.term, outcome.result);
            }
        }

        for envelope in self.core.take_messages() {
            self.transport.send(envelope);
        }

        for read in self.core.take_ready_reads() {
            let Some(mut query) = self.confirming.remove(&read.request_id) else {
                continue;
            };
            match read.result {
                Ok(index) => {
                    query.min_index = index;
                    self.queries.push(query);
                }
                Err(e) => {
                    let _ = query.respond_to.send(Err(e));
                }
            }
        }

        self.serve_queries();
        self.track_leadership();
        Ok(())
    }

    fn complete(&mut self, index: Index, term: Term, result: Result<ApplyResponse>) {
        self.inflight.retain(|_, proposed| *proposed > index);
        self.expiring.retain(|_, proposed| *proposed > index);

        let Some(waiters) = self.waiters.remove(&index) else {
            return;
        };
        for waiter in waiters {
            let reply = if waiter.term != term {
                Err(self.not_leader())
            } else {
                to_response(index, result.clone())
            };
            let _ = waiter.respond_to.send(reply);
        }
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.state_machine.restore(&snapshot.data)?;
        self.state_machine.release_retained(snapshot.index());

        let covered: Vec<Index> = self
            .waiters
            .range(..=snapshot.index())
            .map(|(index, _)| *index)
            .collect();
        for index in covered {
            for waiter in self.waiters.remove(&index).unwrap_or_default() {
                let _ = waiter.respond_to.send(Err(self.not_leader()));
            }
        }
        Ok(())
    }

    fn serve_queries(&mut self) {
        let applied = self.state_machine.applied_index();
        if self.queries.iter().all(|q| q.min_index > applied) {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queries)
            .into_iter()
            .partition(|q| q.min_index <= applied);
        self.queries = waiting;
        for query in ready {
            let reply = self
                .state_machine
                .query(query.session, &query.operation)
                .map(|result| Response::Output {
                    index: applied,
                    result,
                });
            let _ = query.respond_to.send(reply);
        }
    }

    fn track_leadership(&mut self) {
        let state = self.core.leader_state();
        if *self.leader_tx.borrow() != state {
            self.leader_tx.send_replace(state);
        }

        let is_leader = self.core.is_leader();
        if is_leader && !self.was_leader {
            info!(
                "Partition {} node {} serving as leader for term {}",
                self.partition,
                self.node,
                self.core.term()
            );
        } else if !is_leader && self.was_leader {
            self.fail_pending();
        }
        self.was_leader = is_leader;
    }

    /// Answer every proposal waiter after losing leadership
    ///
    /// The entries may still commit under the next leader; retries with the
    /// same sequence numbers are deduplicated there.
    fn fail_pending(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        let count: usize = waiters.values().map(Vec::len).sum();
        for waiter in waiters.into_values().flatten() {
            let _ = waiter.respond_to.send(Err(self.not_leader()));
        }
        self.inflight.clear();
        self.expiring.clear();
        if count > 0 {
            warn!(
                "Partition {} node {} lost leadership with {} pending requests",
                self.partition, self.node, count
            );
        }
    }

    fn publish_gauges(&self) {
        let partition = self.partition.to_string();
        let node = self.node.to_string();
        metrics::gauge!("trellis_raft_term", "partition" => partition.clone(), "node" => node.clone())
            .set(self.core.term() as f64);
        metrics::gauge!("trellis_raft_commit_index", "partition" => partition.clone(), "node" => node.clone())
            .set(self.core.commit_index() as f64);
        metrics::gauge!("trellis_log_entries", "partition" => partition.clone(), "node" => node.clone())
            .set(self.core.log().len() as f64);
        metrics::gauge!("trellis_open_sessions", "partition" => partition, "node" => node)
            .set(self.state_machine.sessions().len() as f64);
    }
}

fn to_response(index: Index, result: Result<ApplyResponse>) -> Result<Response> {
    result.map(|response| match response {
        ApplyResponse::Unit => Response::Ack { index },
        ApplyResponse::SessionOpened(session) => Response::SessionOpened { session, index },
        ApplyResponse::Output(result) => Response::Output { index, result },
    })
}
