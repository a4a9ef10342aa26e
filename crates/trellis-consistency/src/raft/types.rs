// Core Raft data types: log entries, membership, snapshots and status

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use trellis_common::{CompactionMode, Index, NodeId, PartitionId, Result, Term, TrellisError};

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    /// Leader's logical clock (ms) at append time, monotonic along the log
    pub timestamp: u64,
    /// Retention requirement attached when the entry was proposed
    pub compaction: CompactionMode,
    pub payload: EntryPayload,
}

/// Payload of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EntryPayload {
    /// No-op appended by every new leader
    TermStart,
    /// Encoded state machine command
    Command(Vec<u8>),
    /// Full voter set after a single-server membership change
    Configuration(Membership),
}

impl EntryPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EntryPayload::TermStart => "term_start",
            EntryPayload::Command(_) => "command",
            EntryPayload::Configuration(_) => "configuration",
        }
    }
}

/// Voting members of a partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.voters.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Number of votes (or acknowledgements) that form a majority
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn with_voter(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        next.voters.insert(node);
        next
    }

    pub fn without_voter(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        next.voters.remove(&node);
        next
    }
}

/// Replica role within a term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log index covered by the snapshot
    pub index: Index,
    /// Term of the entry at `index`
    pub term: Term,
    /// Timestamp of the entry at `index`
    pub timestamp: u64,
    pub membership: Membership,
    /// Hex encoded MD5 of `data`
    pub checksum: String,
}

/// Point-in-time image of a partition state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(
        index: Index,
        term: Term,
        timestamp: u64,
        membership: Membership,
        data: Vec<u8>,
    ) -> Self {
        let checksum = checksum(&data);
        Self {
            meta: SnapshotMeta {
                index,
                term,
                timestamp,
                membership,
                checksum,
            },
            data,
        }
    }

    pub fn index(&self) -> Index {
        self.meta.index
    }

    pub fn term(&self) -> Term {
        self.meta.term
    }

    /// Verify the data against the recorded checksum
    pub fn verify(&self) -> Result<()> {
        let actual = checksum(&self.data);
        if actual != self.meta.checksum {
            return Err(TrellisError::corrupted_snapshot(format!(
                "checksum mismatch at index {}: expected {}, actual {}",
                self.meta.index, self.meta.checksum, actual
            )));
        }
        Ok(())
    }
}

fn checksum(data: &[u8]) -> String {
    const_hex::encode(Md5::digest(data))
}

/// Persistent vote state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// Leadership notification published on every change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderState {
    pub term: Term,
    pub leader: Option<NodeId>,
}

/// Point-in-time status of one replica of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node: NodeId,
    pub partition: PartitionId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub first_index: Index,
    pub last_index: Index,
    pub commit_index: Index,
    pub applied_index: Index,
    pub global_index: Index,
    pub snapshot_index: Index,
    pub voters: Vec<NodeId>,
}
