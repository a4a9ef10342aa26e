// Raft configuration
// Provides timing and batching settings for the per-partition consensus core

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use trellis_common::PartitionId;

/// Configuration for the Raft consensus protocol
///
/// All timing is expressed in milliseconds and converted into logical ticks
/// of `tick_interval_ms`; the consensus core itself only counts ticks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Tick length in milliseconds (default: 50ms)
    pub tick_interval_ms: u64,

    /// Minimum election timeout in milliseconds (default: 1000ms)
    /// The randomized timeout is drawn from [min, 2 * min]
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 200ms)
    pub heartbeat_interval_ms: u64,

    /// Time a proposal or read may wait for commit (default: 5000ms)
    pub rpc_request_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: usize,

    /// Maximum size of a single command payload in bytes (default: 4MB)
    pub max_entry_size: usize,

    /// Data directory for file-backed log storage
    pub data_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            election_timeout_ms: 1000,
            heartbeat_interval_ms: 200,
            rpc_request_timeout_ms: 5000,
            max_payload_entries: 300,
            max_entry_size: 4 * 1024 * 1024, // 4MB
            data_dir: PathBuf::from("./data/raft"),
        }
    }
}

impl RaftConfig {
    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Get request timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    /// Election timeout range in ticks, inclusive
    pub fn election_timeout_ticks(&self) -> (u64, u64) {
        let min = self.ticks(self.election_timeout_ms).max(2);
        (min, min * 2)
    }

    /// Heartbeat interval in ticks
    pub fn heartbeat_ticks(&self) -> u64 {
        self.ticks(self.heartbeat_interval_ms)
    }

    /// Get the log directory of one partition on one replica
    pub fn partition_dir(&self, node: u64, partition: PartitionId) -> PathBuf {
        self.data_dir
            .join(format!("node-{}", node))
            .join(format!("partition-{}", partition))
    }

    fn ticks(&self, millis: u64) -> u64 {
        (millis / self.tick_interval_ms.max(1)).max(1)
    }
}
