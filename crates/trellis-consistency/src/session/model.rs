//! Server-side session data model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trellis_common::{Index, Result, SessionId};

use crate::service::OperationResult;

/// Result of a command kept for replay to a retrying client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    /// Index of the entry that produced the result
    pub index: Index,
    pub result: Result<OperationResult>,
}

/// A client session replicated in the partition state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Equal to the index of the entry that opened the session
    pub id: SessionId,
    pub client: String,
    pub timeout_ms: u64,
    /// Entry timestamp of the last keep-alive or command
    pub last_keep_alive: u64,
    /// Highest command sequence number applied
    pub last_applied_seq: u64,
    /// Highest sequence number the client confirmed it received
    pub acked_seq: u64,
    /// Results of applied commands not yet acknowledged, by sequence number
    #[serde(default)]
    pub results: BTreeMap<u64, CachedResult>,
}

impl Session {
    pub fn new(id: SessionId, client: String, timeout_ms: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout_ms,
            last_keep_alive: timestamp,
            last_applied_seq: 0,
            acked_seq: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn opened_at(&self) -> Index {
        self.id.id()
    }

    /// Whether the session missed its keep-alive deadline at `now`
    pub fn is_stale(&self, now: u64) -> bool {
        now >= self.last_keep_alive.saturating_add(self.timeout_ms)
    }

    /// Lowest log index whose result is still cached for replay
    pub fn lowest_cached_index(&self) -> Option<Index> {
        self.results.values().map(|r| r.index).min()
    }

    /// Drop cached results the client confirmed
    pub fn acknowledge(&mut self, ack: u64) {
        if ack <= self.acked_seq {
            return;
        }
        self.acked_seq = ack;
        self.results = self.results.split_off(&(ack + 1));
    }
}

/// Outcome of checking a command's sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Next expected command: apply it
    Fresh,
    /// Already applied: answer from the cache
    Duplicate(CachedResult),
    /// An earlier command is missing: the client must retry that one first
    Gap { expected: u64 },
}
