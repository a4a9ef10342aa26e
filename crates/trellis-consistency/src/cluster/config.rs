// Cluster configuration
// Replica count, partition layout and storage of an in-process cluster

use serde::{Deserialize, Serialize};

use trellis_common::{DEFAULT_GROUP, NodeId, PartitionId, Result, TrellisError};

use crate::compaction::CompactionConfig;
use crate::raft::RaftConfig;
use crate::router::PartitionGroup;
use crate::session::SessionConfig;

/// Where replica logs live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Lost when a replica stops
    #[default]
    Memory,
    /// Persisted under `raft.data_dir`
    File,
}

/// Partition group layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub partitions: u32,
}

/// Configuration of an in-process cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Replicas per partition; every node hosts every partition (default: 3)
    pub replicas: u64,

    /// Partition groups; ids are assigned in order starting at 1
    pub groups: Vec<GroupConfig>,

    pub storage: StorageMode,

    /// Fsync every log write in file mode (default: true)
    pub sync_writes: bool,

    pub raft: RaftConfig,
    pub session: SessionConfig,
    pub compaction: CompactionConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            groups: vec![GroupConfig {
                name: DEFAULT_GROUP.to_string(),
                partitions: 1,
            }],
            storage: StorageMode::Memory,
            sync_writes: true,
            raft: RaftConfig::default(),
            session: SessionConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(TrellisError::illegal_argument("replicas must be at least 1"));
        }
        if self.groups.is_empty() || self.groups.iter().any(|g| g.partitions == 0) {
            return Err(TrellisError::illegal_argument(
                "every partition group needs at least one partition",
            ));
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_ms {
            return Err(TrellisError::illegal_argument(
                "heartbeat interval must be shorter than the election timeout",
            ));
        }
        if self.session.keep_alive_interval_ms >= self.session.timeout_ms {
            return Err(TrellisError::illegal_argument(
                "keep-alive interval must be shorter than the session timeout",
            ));
        }
        Ok(())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        (1..=self.replicas).collect()
    }

    /// Groups with their partition ids assigned
    pub fn partition_groups(&self) -> Vec<PartitionGroup> {
        let mut next: PartitionId = 1;
        self.groups
            .iter()
            .map(|group| {
                let partitions: Vec<PartitionId> = (next..next + group.partitions).collect();
                next += group.partitions;
                PartitionGroup::new(group.name.clone(), partitions)
            })
            .collect()
    }
}
