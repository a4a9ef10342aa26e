// Raft peer messages
// Everything replicas of one partition exchange with each other

use serde::{Deserialize, Serialize};

use trellis_common::{Index, NodeId, PartitionId, Term};

use super::types::{LogEntry, Snapshot};

/// Peer-to-peer consensus message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ==================== Election ====================
    /// Candidate asks for a vote
    RequestVote {
        term: Term,
        last_log_index: Index,
        last_log_term: Term,
    },

    /// Vote decision
    RequestVoteResponse { term: Term, granted: bool },

    // ==================== Replication ====================
    /// Entries (or an empty heartbeat) from the leader
    AppendEntries {
        term: Term,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
        /// Lowest index acknowledged by every voter
        global_index: Index,
        /// Highest pending read-index context, echoed back by followers
        read_ctx: Option<u64>,
    },

    /// Replication outcome; a rejection carries the follower's hint of
    /// where to resume
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: Index,
        conflict_hint: Index,
        read_ctx: Option<u64>,
    },

    // ==================== Snapshot ====================
    /// Full state transfer to a follower that fell behind the compaction point
    InstallSnapshot { term: Term, snapshot: Snapshot },

    /// Index the follower holds after installing
    InstallSnapshotResponse { term: Term, last_index: Index },
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    /// Get the message type name for logging
    pub fn msg_type(&self) -> &'static str {
        match self {
            Message::RequestVote { .. } => "RequestVote",
            Message::RequestVoteResponse { .. } => "RequestVoteResponse",
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            Message::InstallSnapshot { .. } => "InstallSnapshot",
            Message::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
        }
    }

    /// Whether the message can only originate from the term's leader
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self,
            Message::AppendEntries { .. } | Message::InstallSnapshot { .. }
        )
    }
}

/// Addressed message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub partition: PartitionId,
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}
