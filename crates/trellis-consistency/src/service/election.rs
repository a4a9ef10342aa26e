//! Leader election service
//!
//! Candidates register under a session; the first candidate becomes leader
//! and the rest queue in registration order. When the leader withdraws or its
//! session ends, the next candidate is promoted and the term advances.

use serde::{Deserialize, Serialize};
use tracing::info;

use trellis_common::{CompactionMode, DomainError, Result, SessionId};

use super::{
    ApplyContext, OperationResult, StateMachineService, decode_operation, encode_output,
};

pub const SERVICE_TYPE: &str = "leader-election";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ElectionOperation {
    /// Enter the election; returns the resulting leadership
    Run { candidate: String },
    /// Leave the election
    Withdraw { candidate: String },
    /// Move a registered candidate to the front and make it leader
    Anoint { candidate: String },
    GetLeadership,
}

impl ElectionOperation {
    pub fn compaction_mode(&self) -> CompactionMode {
        match self {
            // Withdrawal must outlive any retry that could re-register.
            ElectionOperation::Withdraw { .. } => CompactionMode::Sequential,
            _ => CompactionMode::Quorum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Registration {
    candidate: String,
    session: SessionId,
}

/// Elected leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leader {
    pub candidate: String,
    pub session: SessionId,
}

/// Election state visible to clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leadership {
    pub leader: Option<Leader>,
    /// Increments every time a different leader is elected
    pub term: u64,
    /// Entry timestamp at which the current term started
    pub term_started_at: u64,
    /// All registered candidates, leader first
    pub candidates: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ElectionService {
    registrations: Vec<Registration>,
    term: u64,
    term_started_at: u64,
    leader: Option<Leader>,
}

impl ElectionService {
    fn leadership(&self) -> Leadership {
        Leadership {
            leader: self.leader.clone(),
            term: self.term,
            term_started_at: self.term_started_at,
            candidates: self
                .registrations
                .iter()
                .map(|r| r.candidate.clone())
                .collect(),
        }
    }

    /// Re-derive the leader from the head of the registration list
    fn elect(&mut self, ctx: &ApplyContext) {
        let head = self.registrations.first().map(|r| Leader {
            candidate: r.candidate.clone(),
            session: r.session,
        });
        if head == self.leader {
            return;
        }
        if head.is_some() {
            self.term += 1;
            self.term_started_at = ctx.timestamp;
        }
        if let Some(leader) = &head {
            info!(
                "Candidate '{}' elected leader for term {} at index {}",
                leader.candidate, self.term, ctx.index
            );
        }
        self.leader = head;
    }

    fn execute(&mut self, ctx: &ApplyContext, operation: ElectionOperation) -> OperationResult {
        match operation {
            ElectionOperation::Run { candidate } => {
                let session = ctx.require_session()?;
                if !self.registrations.iter().any(|r| r.candidate == candidate) {
                    self.registrations.push(Registration { candidate, session });
                }
                self.elect(ctx);
                encode_output(&self.leadership())
            }
            ElectionOperation::Withdraw { candidate } => {
                self.registrations.retain(|r| r.candidate != candidate);
                self.elect(ctx);
                encode_output(&self.leadership())
            }
            ElectionOperation::Anoint { candidate } => {
                let Some(position) = self
                    .registrations
                    .iter()
                    .position(|r| r.candidate == candidate)
                else {
                    return Err(DomainError::NotFound { name: candidate });
                };
                let registration = self.registrations.remove(position);
                self.registrations.insert(0, registration);
                self.elect(ctx);
                encode_output(&self.leadership())
            }
            ElectionOperation::GetLeadership => encode_output(&self.leadership()),
        }
    }
}

impl StateMachineService for ElectionService {
    fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    fn apply(&mut self, ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode) {
        match decode_operation::<ElectionOperation>(payload) {
            Ok(operation) => {
                let mode = operation.compaction_mode();
                (self.execute(ctx, operation), mode)
            }
            Err(e) => (Err(e), CompactionMode::Quorum),
        }
    }

    fn query(&self, _ctx: &ApplyContext, payload: &[u8]) -> OperationResult {
        match decode_operation::<ElectionOperation>(payload)? {
            ElectionOperation::GetLeadership => encode_output(&self.leadership()),
            other => Err(DomainError::invalid_operation(format!(
                "{:?} must be submitted as a command",
                other
            ))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(data)?;
        Ok(())
    }

    fn session_expired(&mut self, ctx: &ApplyContext, session: SessionId) {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.session != session);
        if before != self.registrations.len() {
            self.elect(ctx);
        }
    }
}
