//! Error taxonomy for Trellis
//!
//! This module defines:
//! - `TrellisError`: protocol level failures surfaced by replicas and clients
//! - `DomainError`: outcomes of a primitive operation that are part of its
//!   result (a lock not held, a missing key) rather than protocol failures

use serde::{Deserialize, Serialize};

use crate::types::{Index, NodeId, PartitionId, SessionId};

/// Result alias used across the Trellis crates
pub type Result<T, E = TrellisError> = std::result::Result<T, E>;

/// Protocol level error types
///
/// Errors are `Clone` and serializable because they are cached as command
/// results in session state and travel inside snapshots.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TrellisError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("no quorum available")]
    NoQuorum,

    #[error("operation timed out, outcome unknown")]
    Timeout,

    #[error("session {session} expired")]
    SessionExpired { session: SessionId },

    #[error("unknown session {session}")]
    UnknownSession { session: SessionId },

    #[error("command sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("unknown partition {partition}")]
    UnknownPartition { partition: PartitionId },

    #[error("unknown primitive type '{name}'")]
    UnknownPrimitiveType { name: String },

    #[error("log index {index} has been compacted")]
    Compacted { index: Index },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("corrupted snapshot: {message}")]
    CorruptedSnapshot { message: String },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("caused: {message}")]
    IllegalArgument { message: String },

    #[error("{0}")]
    Domain(DomainError),

    #[error("replica is shutting down")]
    Shutdown,
}

impl TrellisError {
    pub fn storage(message: impl Into<String>) -> Self {
        TrellisError::Storage {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        TrellisError::Codec {
            message: message.into(),
        }
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        TrellisError::IllegalArgument {
            message: message.into(),
        }
    }

    pub fn corrupted_snapshot(message: impl Into<String>) -> Self {
        TrellisError::CorruptedSnapshot {
            message: message.into(),
        }
    }

    /// Errors a client may retry against the same or another replica.
    ///
    /// Retrying a command after `Timeout` is safe only with the same sequence
    /// number, which the client session guarantees.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TrellisError::NotLeader { .. } | TrellisError::NoQuorum | TrellisError::Timeout
        )
    }

    /// Errors after which the client session can no longer be used.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TrellisError::SessionExpired { .. } | TrellisError::UnknownSession { .. }
        )
    }

    /// Errors that stop the replica: continuing would risk divergence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrellisError::Storage { .. } | TrellisError::CorruptedSnapshot { .. }
        )
    }
}

impl From<DomainError> for TrellisError {
    fn from(value: DomainError) -> Self {
        TrellisError::Domain(value)
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(value: serde_json::Error) -> Self {
        TrellisError::codec(value.to_string())
    }
}

impl From<std::io::Error> for TrellisError {
    fn from(value: std::io::Error) -> Self {
        TrellisError::storage(value.to_string())
    }
}

/// Domain level outcomes returned as part of an operation's result
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainError {
    #[error("'{name}' not found")]
    NotFound { name: String },

    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },
}

impl DomainError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        DomainError::IllegalState {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        DomainError::InvalidOperation {
            message: message.into(),
        }
    }
}
