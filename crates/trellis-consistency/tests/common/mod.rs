//! Shared helpers for cluster integration tests
//!
//! Clusters here run with short ticks so elections, keep-alives and
//! compaction checks happen within a few hundred milliseconds.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use trellis_common::{PartitionId, Result};
use trellis_consistency::client::ClientConfig;
use trellis_consistency::raft::RaftStatus;
use trellis_consistency::{ClusterConfig, LocalCluster, TrellisClient};

pub const PARTITION: PartitionId = 1;
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Three replicas of one partition with fast timers
pub fn fast_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.raft.tick_interval_ms = 10;
    config.raft.heartbeat_interval_ms = 30;
    config.raft.election_timeout_ms = 150;
    config.raft.rpc_request_timeout_ms = 1000;
    config.session.timeout_ms = 2000;
    config.session.keep_alive_interval_ms = 200;
    config.session.expiry_check_interval_ms = 100;
    config.compaction.check_interval_ms = 50;
    config
}

pub async fn start_cluster(config: ClusterConfig) -> LocalCluster {
    let cluster = LocalCluster::start(config).await.unwrap();
    cluster.wait_for_leaders(STARTUP_TIMEOUT).await.unwrap();
    cluster
}

pub fn client_config(cluster: &LocalCluster) -> ClientConfig {
    let config = cluster.config();
    ClientConfig {
        session_timeout_ms: config.session.timeout_ms,
        keep_alive_interval_ms: config.session.keep_alive_interval_ms,
        retry_attempts: 200,
        retry_backoff_ms: 20,
        ..Default::default()
    }
}

pub fn client(cluster: &LocalCluster) -> TrellisClient {
    cluster.client_with(client_config(cluster))
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Status of the current leader of `partition`
pub async fn leader_status(cluster: &LocalCluster, partition: PartitionId) -> Result<RaftStatus> {
    let leader = cluster.wait_for_leader(partition, STARTUP_TIMEOUT).await?;
    cluster.status(leader, partition).await
}
