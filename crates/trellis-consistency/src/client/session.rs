// Client session
// Sequences commands, tracks the observed index and keeps the session alive

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use trellis_common::{
    CompactionMode, Consistency, Index, PartitionId, Result, SessionId, TrellisError,
};

use super::Caller;
use crate::dispatch::{Operation, Request, Response};
use crate::service::OperationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Expired,
    Closed,
}

/// Command sent but not yet answered
#[derive(Debug, Clone)]
struct PendingCommand {
    seq: u64,
    operation: Operation,
    compaction: CompactionMode,
}

/// What a failed command left behind on the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandFate {
    /// May or may not have been applied; resend with the same sequence number
    Unknown,
    /// Refused before it reached the log; the sequence number is still free
    Rejected,
    /// Applied with an error result that the partition cached
    Applied,
}

impl CommandFate {
    fn of(error: &TrellisError) -> Self {
        match error {
            TrellisError::UnknownPrimitiveType { .. } => CommandFate::Applied,
            TrellisError::IllegalArgument { .. }
            | TrellisError::SequenceGap { .. }
            | TrellisError::UnknownPartition { .. } => CommandFate::Rejected,
            _ => CommandFate::Unknown,
        }
    }
}

#[derive(Debug)]
struct CommandState {
    next_seq: u64,
    /// Command whose outcome is unknown; it is resent with the same sequence
    /// number before any later command
    unsettled: Option<PendingCommand>,
}

struct SessionInner {
    id: SessionId,
    partition: PartitionId,
    caller: Arc<Caller>,
    commands: tokio::sync::Mutex<CommandState>,
    acked_seq: AtomicU64,
    observed_index: AtomicU64,
    state: Mutex<SessionState>,
    keep_alive_suspended: AtomicBool,
}

/// Exactly-once channel from this client into one partition
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("partition", &self.inner.partition)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(
        id: SessionId,
        partition: PartitionId,
        opened_at: Index,
        caller: Arc<Caller>,
    ) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                partition,
                caller,
                commands: tokio::sync::Mutex::new(CommandState {
                    next_seq: 1,
                    unsettled: None,
                }),
                acked_seq: AtomicU64::new(0),
                observed_index: AtomicU64::new(opened_at),
                state: Mutex::new(SessionState::Open),
                keep_alive_suspended: AtomicBool::new(false),
            }),
        };
        spawn_keep_alive(Arc::downgrade(&session.inner));
        session
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn partition(&self) -> PartitionId {
        self.inner.partition
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Highest log index this session has seen the effects of
    pub fn observed_index(&self) -> Index {
        self.inner.observed_index.load(Ordering::Acquire)
    }

    /// Highest sequence number whose result was received
    pub fn acked_seq(&self) -> u64 {
        self.inner.acked_seq.load(Ordering::Acquire)
    }

    fn observe(&self, index: Index) {
        self.inner.observed_index.fetch_max(index, Ordering::AcqRel);
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Expired => Err(TrellisError::SessionExpired {
                session: self.inner.id,
            }),
            SessionState::Closed => Err(TrellisError::UnknownSession {
                session: self.inner.id,
            }),
        }
    }

    fn record_failure(&self, error: &TrellisError) {
        if error.is_session_fatal() {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Open {
                warn!(
                    "Session {} on partition {} lost: {}",
                    self.inner.id, self.inner.partition, error
                );
                *state = SessionState::Expired;
            }
        }
    }

    /// Submit a command through the partition leader
    ///
    /// Commands of one session are applied in call order. A command that
    /// failed with an unknown outcome (timeout, leader change) is resent with
    /// its original sequence number before the next command goes out, so it
    /// is applied at most once. A command that was refused or applied with an
    /// error is settled right away and does not hold back later commands.
    pub async fn execute(
        &self,
        operation: Operation,
        compaction: CompactionMode,
    ) -> Result<OperationResult> {
        self.ensure_open()?;
        let mut commands = self.inner.commands.lock().await;
        if let Some(pending) = commands.unsettled.clone() {
            debug!(
                "Session {} resending command {} before continuing",
                self.inner.id, pending.seq
            );
            match self.submit(&pending).await {
                Ok(_) => commands.unsettled = None,
                Err(e) => {
                    if !self.settle(&mut commands, &pending, &e) {
                        return Err(e);
                    }
                    debug!(
                        "Session {} gave up on command {}: {}",
                        self.inner.id, pending.seq, e
                    );
                }
            }
        }

        let pending = PendingCommand {
            seq: commands.next_seq,
            operation,
            compaction,
        };
        commands.next_seq += 1;
        commands.unsettled = Some(pending.clone());
        match self.submit(&pending).await {
            Ok(result) => {
                commands.unsettled = None;
                Ok(result)
            }
            Err(e) => {
                self.settle(&mut commands, &pending, &e);
                Err(e)
            }
        }
    }

    /// Clear a failed command whose fate is known; false if it must be resent
    fn settle(
        &self,
        commands: &mut CommandState,
        pending: &PendingCommand,
        error: &TrellisError,
    ) -> bool {
        match CommandFate::of(error) {
            CommandFate::Unknown => false,
            CommandFate::Rejected => {
                // Nothing was logged, so the next command takes over the number.
                commands.next_seq = pending.seq;
                commands.unsettled = None;
                true
            }
            CommandFate::Applied => {
                self.inner.acked_seq.fetch_max(pending.seq, Ordering::AcqRel);
                commands.unsettled = None;
                true
            }
        }
    }

    async fn submit(&self, pending: &PendingCommand) -> Result<OperationResult> {
        let request = Request::Execute {
            session: self.inner.id,
            seq: pending.seq,
            ack: self.acked_seq(),
            operation: pending.operation.clone(),
            compaction: pending.compaction,
        };
        match self
            .inner
            .caller
            .send_to_leader(self.inner.partition, request)
            .await
        {
            Ok(Response::Output { index, result }) => {
                self.observe(index);
                self.inner.acked_seq.fetch_max(pending.seq, Ordering::AcqRel);
                Ok(result)
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Evaluate a read-only operation at the given consistency level
    pub async fn query(
        &self,
        operation: Operation,
        consistency: Consistency,
    ) -> Result<OperationResult> {
        self.ensure_open()?;
        let request = Request::Query {
            session: self.inner.id,
            operation,
            consistency,
            observed_index: self.observed_index(),
        };
        let caller = &self.inner.caller;
        let partition = self.inner.partition;
        let response = match consistency {
            Consistency::Linearizable => caller.send_to_leader(partition, request).await,
            Consistency::Sequential => caller.send_to_any(partition, request, true).await,
            Consistency::Causal => caller.send_to_any(partition, request, false).await,
        };
        match response {
            Ok(Response::Output { index, result }) => {
                self.observe(index);
                Ok(result)
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Renew the session and acknowledge received results
    pub async fn keep_alive(&self) -> Result<()> {
        self.ensure_open()?;
        let request = Request::KeepAlive {
            session: self.inner.id,
            command_ack: self.acked_seq(),
        };
        match self
            .inner
            .caller
            .send_to_leader(self.inner.partition, request)
            .await
        {
            Ok(Response::Ack { index }) => {
                self.observe(index);
                Ok(())
            }
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Stop sending keep-alives while keeping the session usable
    pub fn suspend_keep_alive(&self) {
        self.inner.keep_alive_suspended.store(true, Ordering::Release);
    }

    pub fn resume_keep_alive(&self) {
        self.inner.keep_alive_suspended.store(false, Ordering::Release);
    }

    /// Close the session; everything it holds is released
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Open {
                return Ok(());
            }
            *state = SessionState::Closed;
        }
        let request = Request::CloseSession {
            session: self.inner.id,
        };
        match self
            .inner
            .caller
            .send_to_leader(self.inner.partition, request)
            .await
        {
            Ok(_) => {
                info!(
                    "Session {} on partition {} closed",
                    self.inner.id, self.inner.partition
                );
                Ok(())
            }
            Err(e) if e.is_session_fatal() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn unexpected(response: Response) -> TrellisError {
    TrellisError::codec(format!("unexpected response: {:?}", response))
}

/// Keep-alive loop; ends when the session is dropped, closed or expired
fn spawn_keep_alive(session: Weak<SessionInner>) {
    let Some(period) = session
        .upgrade()
        .map(|inner| inner.caller.config.keep_alive_interval())
    else {
        return;
    };
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = session.upgrade() else {
                break;
            };
            let session = ClientSession { inner };
            if !session.is_open() {
                break;
            }
            if session.inner.keep_alive_suspended.load(Ordering::Acquire) {
                continue;
            }
            if let Err(e) = session.keep_alive().await {
                if e.is_session_fatal() {
                    break;
                }
                debug!("Keep-alive for session {} failed: {}", session.id(), e);
            }
        }
    });
}
