// Metric descriptions for the replication core
// The library crates record; this module only describes and adds server-level gauges

use std::time::Instant;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Describe every metric once at startup
pub fn init_metrics() {
    // Raft
    describe_counter!(
        "trellis_raft_elections_total",
        "Elections started by a replica"
    );
    describe_counter!(
        "trellis_raft_leader_elected_total",
        "Times a replica became leader"
    );
    describe_counter!(
        "trellis_raft_proposals_total",
        "Entries appended by a leader"
    );
    describe_counter!(
        "trellis_raft_snapshot_installs_total",
        "Snapshots sent to lagging followers"
    );
    describe_gauge!("trellis_raft_term", "Current term of a replica");
    describe_gauge!(
        "trellis_raft_commit_index",
        "Highest committed log index of a replica"
    );
    describe_gauge!("trellis_log_entries", "Live entries in a replica log");

    // Dispatch
    describe_counter!(
        "trellis_proposals_total",
        "Client requests proposed to the log"
    );
    describe_counter!(
        "trellis_applied_entries_total",
        "Log entries applied to the state machine"
    );
    describe_counter!(
        "trellis_duplicate_commands_total",
        "Retried commands answered from the session cache"
    );

    // Sessions
    describe_gauge!("trellis_open_sessions", "Sessions open on a partition");
    describe_counter!(
        "trellis_sessions_expired_total",
        "Sessions expired for missing keep-alives"
    );

    // Compaction
    describe_counter!("trellis_compactions_total", "Log compactions performed");
    describe_counter!(
        "trellis_compaction_stalls_total",
        "Compactions held back by a retained entry"
    );

    // Server
    describe_gauge!("trellis_cluster_nodes", "Nodes running in this process");
    describe_gauge!(
        "trellis_partitions_led",
        "Partitions that currently have a leader"
    );
    describe_histogram!(
        "trellis_startup_duration_seconds",
        "Time from boot until every partition had a leader"
    );

    tracing::info!("Metrics initialized");
}

/// Update cluster-level gauges
pub fn set_cluster_status(nodes: usize, partitions_led: usize) {
    gauge!("trellis_cluster_nodes").set(nodes as f64);
    gauge!("trellis_partitions_led").set(partitions_led as f64);
}

pub fn record_startup(duration_secs: f64) {
    histogram!("trellis_startup_duration_seconds").record(duration_secs);
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
