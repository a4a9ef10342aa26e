//! Identifiers and protocol enums shared by every Trellis component

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrellisError;

/// Replica identifier, unique within a cluster
pub type NodeId = u64;

/// Position of an entry in a partition's log, starting at 1
pub type Index = u64;

/// Raft election epoch
pub type Term = u64;

/// Partition identifier, unique within a cluster
pub type PartitionId = u32;

/// Client session identifier
///
/// A session id is the log index of the entry that opened the session, which
/// makes it unique within its partition and identical on every replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        SessionId(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read consistency level requested by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Served by the leader after confirming leadership with a quorum
    #[default]
    Linearizable,
    /// Served by any replica that has applied at least the caller's last
    /// observed index; leader preferred
    Sequential,
    /// Same bound as `Sequential`, served by any replica
    Causal,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Linearizable => "linearizable",
            Consistency::Sequential => "sequential",
            Consistency::Causal => "causal",
        }
    }
}

impl Display for Consistency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Consistency {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linearizable" | "atomic" => Ok(Consistency::Linearizable),
            "sequential" => Ok(Consistency::Sequential),
            "causal" => Ok(Consistency::Causal),
            other => Err(TrellisError::illegal_argument(format!(
                "unknown consistency level '{}'",
                other
            ))),
        }
    }
}

/// Retention requirement of a log entry
///
/// Variants are ordered from the weakest to the strongest requirement, so the
/// effective mode of an entry is the maximum of every mode attached to it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    /// Removable once covered by a snapshot acknowledged by a quorum
    #[default]
    Quorum,
    /// Additionally retained while a client may still retry it
    Sequential,
    /// Additionally retained until every replica has acknowledged it
    Full,
}

impl CompactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionMode::Quorum => "quorum",
            CompactionMode::Sequential => "sequential",
            CompactionMode::Full => "full",
        }
    }
}

impl Display for CompactionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_from_str() {
        assert_eq!(
            "LINEARIZABLE".parse::<Consistency>().unwrap(),
            Consistency::Linearizable
        );
        assert_eq!(
            "atomic".parse::<Consistency>().unwrap(),
            Consistency::Linearizable
        );
        assert_eq!(
            "causal".parse::<Consistency>().unwrap(),
            Consistency::Causal
        );
        assert!("eventual".parse::<Consistency>().is_err());
    }

    #[test]
    fn test_compaction_mode_ordering() {
        assert!(CompactionMode::Quorum < CompactionMode::Sequential);
        assert!(CompactionMode::Sequential < CompactionMode::Full);
        assert_eq!(
            CompactionMode::Quorum.max(CompactionMode::Full),
            CompactionMode::Full
        );
    }

    #[test]
    fn test_session_id_is_transparent() {
        let id = SessionId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(id.to_string(), "42");
    }
}
