//! Main entry point for the Trellis server.
//!
//! Boots every replica of every configured partition in this process and
//! serves until Ctrl+C or SIGTERM.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use trellis_consistency::LocalCluster;
use trellis_server::{
    config::{Cli, ServerConfig},
    metrics::{self, Timer},
    startup::{self, LoggingConfig},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = match ServerConfig::load(&cli) {
        Ok(configuration) => configuration,
        Err(e) => {
            // Still report through the usual sinks
            if let Ok(_guard) = startup::init_logging(&LoggingConfig::from_env()) {
                error!("Failed to load configuration: {:#}", e);
            }
            return Err(e);
        }
    };

    let _logging_guard = startup::init_logging(&configuration.logging_config())
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    metrics::init_metrics();

    let cluster_config = configuration.cluster.clone();
    info!(
        replicas = cluster_config.replicas,
        groups = cluster_config.groups.len(),
        storage = ?cluster_config.storage,
        "Starting Trellis cluster"
    );

    let timer = Timer::new();
    let cluster = LocalCluster::start(cluster_config.clone()).await?;
    let shutdown = startup::wait_for_shutdown_signal();

    let startup_timeout = Duration::from_millis(cluster_config.raft.election_timeout_ms) * 20;
    match startup::run_with_shutdown(cluster.wait_for_leaders(startup_timeout), shutdown.subscribe())
        .await
    {
        Some(Ok(())) => {
            metrics::record_startup(timer.elapsed_secs());
            info!("All partitions elected a leader in {:.3}s", timer.elapsed_secs());
        }
        Some(Err(e)) => warn!("Cluster started without a leader on every partition: {}", e),
        None => {
            cluster.shutdown().await;
            return Ok(());
        }
    }

    let reporter = tokio::spawn(report_status(cluster.clone()));
    let mut shutdown_rx = shutdown.subscribe();
    let _ = shutdown_rx.recv().await;

    reporter.abort();
    cluster.shutdown().await;
    info!("Trellis server stopped");
    Ok(())
}

/// Logs the leader of every partition periodically
async fn report_status(cluster: LocalCluster) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        interval.tick().await;
        let nodes = cluster.node_ids().await.len();
        let mut led = 0;
        for group in cluster.config().partition_groups() {
            for &partition in &group.partitions {
                match cluster.leader(partition) {
                    Some(leader) => {
                        led += 1;
                        info!(group = %group.name, partition, leader, "Partition status");
                    }
                    None => warn!(group = %group.name, partition, "Partition has no leader"),
                }
            }
        }
        metrics::set_cluster_status(nodes, led);
    }
}
