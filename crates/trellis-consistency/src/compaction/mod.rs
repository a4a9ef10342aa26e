//! Log compaction policy
//!
//! Decides how much of the log prefix a replica may drop after taking a
//! snapshot. Every entry is covered by the snapshot once the snapshot index
//! passes it; entries tagged SEQUENTIAL or FULL additionally wait for the
//! conditions of their mode, and the first entry that cannot go yet bounds
//! the compacted prefix.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trellis_common::{CompactionMode, Index, PartitionId};

/// Compaction tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Live log entries that trigger a compaction (default: 1000)
    pub entry_threshold: u64,

    /// How often the threshold is checked (default: 1000ms)
    pub check_interval_ms: u64,

    /// Committed entries that must follow a SEQUENTIAL entry before it may be
    /// dropped (default: 64). A safety margin for client retries that are
    /// still in flight, not a hard guarantee.
    pub sequential_retry_margin: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            entry_threshold: 1000,
            check_interval_ms: 1000,
            sequential_retry_margin: 64,
        }
    }
}

impl CompactionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// Replica state a compaction decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionInputs {
    /// Index the new snapshot covers; never above `commit_index`
    pub snapshot_index: Index,
    pub commit_index: Index,
    /// Lowest index acknowledged by every voter
    pub global_index: Index,
    /// Lowest index any open session may still retry against
    pub retention_floor: Index,
    /// Current compaction point of the log
    pub compacted_index: Index,
}

/// Outcome of planning a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Highest index that may be dropped
    pub upto: Index,
    /// First retained entry that stopped the prefix short of the snapshot
    pub stalled_at: Option<(Index, CompactionMode)>,
}

impl CompactionPlan {
    pub fn makes_progress(&self, inputs: &CompactionInputs) -> bool {
        self.upto > inputs.compacted_index
    }
}

/// Whether an entry of `mode` at `index` may be removed
pub fn is_eligible(
    mode: CompactionMode,
    index: Index,
    inputs: &CompactionInputs,
    sequential_retry_margin: u64,
) -> bool {
    if index > inputs.snapshot_index || inputs.snapshot_index > inputs.commit_index {
        return false;
    }
    match mode {
        CompactionMode::Quorum => true,
        CompactionMode::Sequential => {
            index.saturating_add(sequential_retry_margin) <= inputs.commit_index
                && index < inputs.retention_floor
        }
        CompactionMode::Full => index <= inputs.global_index,
    }
}

/// Per-replica compaction policy
#[derive(Debug, Clone)]
pub struct CompactionController {
    partition: PartitionId,
    config: CompactionConfig,
    stalled_at: Option<Index>,
}

impl CompactionController {
    pub fn new(partition: PartitionId, config: CompactionConfig) -> Self {
        Self {
            partition,
            config,
            stalled_at: None,
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Whether `live_entries` warrants a compaction attempt
    pub fn should_compact(&self, live_entries: u64) -> bool {
        live_entries > self.config.entry_threshold
    }

    /// Longest prefix up to the snapshot index whose retained entries are
    /// all eligible
    pub fn plan(
        &mut self,
        inputs: &CompactionInputs,
        retained: &BTreeMap<Index, CompactionMode>,
    ) -> CompactionPlan {
        let upper = inputs.snapshot_index.min(inputs.commit_index);
        let blocker = retained
            .range(inputs.compacted_index + 1..=upper)
            .find(|(index, mode)| {
                !is_eligible(**mode, **index, inputs, self.config.sequential_retry_margin)
            })
            .map(|(index, mode)| (*index, *mode));

        let plan = CompactionPlan {
            upto: blocker.map(|(index, _)| index - 1).unwrap_or(upper),
            stalled_at: blocker,
        };
        self.report(&plan, inputs);
        plan
    }

    fn report(&mut self, plan: &CompactionPlan, inputs: &CompactionInputs) {
        match plan.stalled_at {
            Some((index, mode)) => {
                if self.stalled_at != Some(index) {
                    warn!(
                        partition = self.partition,
                        "Compaction held at index {} by {} entry (commit {}, global {}, session floor {})",
                        index,
                        mode,
                        inputs.commit_index,
                        inputs.global_index,
                        inputs.retention_floor
                    );
                }
                metrics::counter!("trellis_compaction_stalls_total", "partition" => self.partition.to_string(), "mode" => mode.as_str())
                    .increment(1);
                self.stalled_at = Some(index);
            }
            None => {
                if let Some(index) = self.stalled_at.take() {
                    info!(
                        partition = self.partition,
                        "Compaction past index {} resumed", index
                    );
                }
            }
        }
        debug!(
            partition = self.partition,
            "Compaction plan up to {} for snapshot at {}", plan.upto, inputs.snapshot_index
        );
    }
}
