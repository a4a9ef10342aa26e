// Session manager
// Replicated session bookkeeping: every mutation is driven by an applied log
// entry and its timestamp, so all replicas reach the same decisions

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trellis_common::{Index, Result, SessionId, TrellisError};

use super::model::{CachedResult, SequenceCheck, Session};
use crate::service::OperationResult;

/// Number of expired session ids remembered to answer `SessionExpired`
/// instead of `UnknownSession`
const EXPIRED_HISTORY: usize = 1024;

/// Arena of open sessions of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    expired: VecDeque<SessionId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Register a session opened by the entry at `index`
    pub fn open(&mut self, index: Index, client: String, timeout_ms: u64, timestamp: u64) -> SessionId {
        let id = SessionId::new(index);
        info!(
            "Session {} opened for client '{}' with timeout {}ms",
            id, client, timeout_ms
        );
        self.sessions
            .insert(id, Session::new(id, client, timeout_ms, timestamp));
        id
    }

    /// Refresh liveness and trim results the client acknowledged
    pub fn keep_alive(&mut self, id: SessionId, command_ack: u64, timestamp: u64) -> Result<()> {
        let session = self.session_mut(id)?;
        session.last_keep_alive = session.last_keep_alive.max(timestamp);
        session.acknowledge(command_ack);
        debug!("Session {} kept alive, acked up to {}", id, command_ack);
        Ok(())
    }

    /// Refresh liveness only; every command counts as a keep-alive
    pub fn touch(&mut self, id: SessionId, timestamp: u64) -> Result<()> {
        let session = self.session_mut(id)?;
        session.last_keep_alive = session.last_keep_alive.max(timestamp);
        Ok(())
    }

    pub fn close(&mut self, id: SessionId) -> Result<Session> {
        let session = self.sessions.remove(&id).ok_or_else(|| self.missing(id))?;
        info!("Session {} closed by client '{}'", id, session.client);
        Ok(session)
    }

    /// Expire the session if it is still stale at `timestamp`
    ///
    /// The leader proposes expiry from its own view of time; this re-check
    /// against the entry timestamp is what every replica agrees on.
    pub fn expire_if_stale(&mut self, id: SessionId, timestamp: u64) -> Option<Session> {
        let stale = self.sessions.get(&id)?.is_stale(timestamp);
        if !stale {
            debug!("Session {} recovered before expiry was applied", id);
            return None;
        }
        let session = self.sessions.remove(&id)?;
        if self.expired.len() >= EXPIRED_HISTORY {
            self.expired.pop_front();
        }
        self.expired.push_back(id);
        info!(
            "Session {} of client '{}' expired (last keep-alive at {}, now {})",
            id, session.client, session.last_keep_alive, timestamp
        );
        Some(session)
    }

    /// Sessions that missed their deadline at `now`
    pub fn stale_sessions(&self, now: u64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(now))
            .map(|s| s.id)
            .collect()
    }

    /// Give every session a fresh deadline
    ///
    /// Applied on each leader change so that sessions do not expire because
    /// of the time it took to elect a new leader.
    pub fn reset_keep_alives(&mut self, timestamp: u64) {
        for session in self.sessions.values_mut() {
            session.last_keep_alive = session.last_keep_alive.max(timestamp);
        }
    }

    /// Fail with `SessionExpired` or `UnknownSession` unless the session is open
    pub fn ensure_open(&self, id: SessionId) -> Result<()> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else {
            Err(self.missing(id))
        }
    }

    pub fn check_sequence(&self, id: SessionId, seq: u64) -> Result<SequenceCheck> {
        let session = self.sessions.get(&id).ok_or_else(|| self.missing(id))?;
        let expected = session.last_applied_seq + 1;
        if seq < expected {
            return match session.results.get(&seq) {
                Some(cached) => Ok(SequenceCheck::Duplicate(cached.clone())),
                None => Err(TrellisError::illegal_argument(format!(
                    "command {} of session {} was already acknowledged",
                    seq, id
                ))),
            };
        }
        if seq > expected {
            return Ok(SequenceCheck::Gap { expected });
        }
        Ok(SequenceCheck::Fresh)
    }

    /// Cache the result of the command `seq` applied at `index`
    ///
    /// The command also counts as a keep-alive at `timestamp` and carries the
    /// client's acknowledgement of earlier results.
    pub fn record_result(
        &mut self,
        id: SessionId,
        seq: u64,
        ack: u64,
        index: Index,
        timestamp: u64,
        result: Result<OperationResult>,
    ) -> Result<()> {
        let session = self.session_mut(id)?;
        session.last_keep_alive = session.last_keep_alive.max(timestamp);
        session.acknowledge(ack);
        session.last_applied_seq = seq;
        session.results.insert(seq, CachedResult { index, result });
        Ok(())
    }

    /// Lowest log index any open session may still need to replay
    pub fn retention_floor(&self) -> Index {
        self.sessions
            .values()
            .filter_map(Session::lowest_cached_index)
            .min()
            .unwrap_or(Index::MAX)
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        if !self.sessions.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.sessions
            .get_mut(&id)
            .ok_or(TrellisError::UnknownSession { session: id })
    }

    fn missing(&self, id: SessionId) -> TrellisError {
        if self.expired.contains(&id) {
            TrellisError::SessionExpired { session: id }
        } else {
            TrellisError::UnknownSession { session: id }
        }
    }
}
