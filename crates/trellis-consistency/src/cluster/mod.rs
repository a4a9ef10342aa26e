//! In-process cluster runtime
//!
//! Nodes, the peer transport between them and `LocalCluster`, which boots N
//! replicas of every configured partition inside one process and exposes the
//! administrative surface (replica changes, fault injection, shutdown).

pub mod config;
pub mod node;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use trellis_common::{NodeId, PartitionId, Result, TrellisError};

pub use config::{ClusterConfig, GroupConfig, StorageMode};
pub use node::{Node, open_log};
pub use transport::{LocalTransport, Transport};

use crate::client::{ClientConfig, TrellisClient};
use crate::dispatch::{PartitionHandle, Request, Response, ServerContext};
use crate::raft::{Membership, RaftStatus};
use crate::router::Router;
use crate::service::ServiceRegistry;

/// Request path from clients to a specific replica
#[async_trait]
pub trait ReplicaChannel: Send + Sync {
    async fn call(&self, node: NodeId, partition: PartitionId, request: Request)
    -> Result<Response>;
}

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ClusterInner {
    config: ClusterConfig,
    registry: Arc<ServiceRegistry>,
    transport: Arc<LocalTransport>,
    router: Arc<Router>,
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    handles: DashMap<(NodeId, PartitionId), PartitionHandle>,
}

#[async_trait]
impl ReplicaChannel for ClusterInner {
    async fn call(
        &self,
        node: NodeId,
        partition: PartitionId,
        request: Request,
    ) -> Result<Response> {
        // An isolated node is unreachable for clients too
        if self.transport.is_isolated(node) {
            return Err(TrellisError::Timeout);
        }
        let handle = self
            .handles
            .get(&(node, partition))
            .map(|h| h.clone())
            .ok_or(TrellisError::Shutdown)?;
        handle.call(request).await
    }
}

/// N replicas of every partition running in this process
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// Boot every node with the built-in services
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        Self::start_with_registry(config, ServiceRegistry::with_builtins()).await
    }

    pub async fn start_with_registry(
        config: ClusterConfig,
        registry: ServiceRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let router = Arc::new(Router::new(config.partition_groups())?);
        let voters = config.node_ids();
        for partition in router.partitions() {
            router.set_replicas(partition, voters.clone());
        }

        let cluster = Self {
            inner: Arc::new(ClusterInner {
                registry: Arc::new(registry),
                transport: Arc::new(LocalTransport::new()),
                router,
                nodes: Mutex::new(BTreeMap::new()),
                handles: DashMap::new(),
                config,
            }),
        };
        let membership = Membership::new(voters.iter().copied());
        for node in voters {
            cluster.launch(node, &membership).await?;
        }
        info!(
            "Cluster started with {} replicas of {} partitions",
            cluster.inner.config.replicas,
            cluster.inner.router.partitions().len()
        );
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn router(&self) -> Arc<Router> {
        self.inner.router.clone()
    }

    pub fn transport(&self) -> Arc<LocalTransport> {
        self.inner.transport.clone()
    }

    pub fn channel(&self) -> Arc<dyn ReplicaChannel> {
        self.inner.clone()
    }

    /// Client with a default configuration derived from the cluster's
    pub fn client(&self) -> TrellisClient {
        let mut config = ClientConfig::default();
        config.session_timeout_ms = self.inner.config.session.timeout_ms;
        config.keep_alive_interval_ms = self.inner.config.session.keep_alive_interval_ms;
        self.client_with(config)
    }

    pub fn client_with(&self, config: ClientConfig) -> TrellisClient {
        TrellisClient::new(self.channel(), self.router(), config)
    }

    fn context(&self) -> ServerContext {
        ServerContext {
            raft: self.inner.config.raft.clone(),
            session: self.inner.config.session.clone(),
            compaction: self.inner.config.compaction.clone(),
            registry: self.inner.registry.clone(),
            transport: self.inner.transport.clone(),
        }
    }

    /// Start `node` hosting every partition with the given bootstrap membership
    async fn launch(&self, node: NodeId, membership: &Membership) -> Result<()> {
        let config = &self.inner.config;
        let mut partitions = Vec::new();
        for partition in self.inner.router.partitions() {
            let log = open_log(
                config.storage,
                &config.raft,
                config.sync_writes,
                node,
                partition,
            )?;
            partitions.push((partition, membership.clone(), log));
        }
        let started = Node::start(node, partitions, &self.context(), &self.inner.transport)?;
        for handle in started.handles() {
            self.inner
                .handles
                .insert((node, handle.partition()), handle.clone());
            self.watch_leadership(handle);
        }
        self.inner.nodes.lock().await.insert(node, started);
        Ok(())
    }

    /// Keep the router's leader hints in step with a replica's view
    fn watch_leadership(&self, handle: &PartitionHandle) {
        let router = self.inner.router.clone();
        let node = handle.node();
        let partition = handle.partition();
        let mut leader = handle.subscribe_leader();
        tokio::spawn(async move {
            while leader.changed().await.is_ok() {
                let state = *leader.borrow_and_update();
                match state.leader {
                    Some(current) => router.update_leader(partition, Some(current)),
                    None if router.leader(partition) == Some(node) => {
                        router.update_leader(partition, None)
                    }
                    None => {}
                }
            }
        });
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.inner.nodes.lock().await.keys().copied().collect()
    }

    /// Replica currently acting as leader of `partition`, if any
    pub fn leader(&self, partition: PartitionId) -> Option<NodeId> {
        self.inner
            .handles
            .iter()
            .filter(|h| h.key().1 == partition)
            .filter(|h| !self.inner.transport.is_isolated(h.key().0))
            .map(|h| (h.key().0, h.leader_state()))
            .filter(|(node, state)| state.leader == Some(*node))
            .max_by_key(|(_, state)| state.term)
            .map(|(node, _)| node)
    }

    pub async fn wait_for_leader(&self, partition: PartitionId, timeout: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader(partition) {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(TrellisError::Timeout);
            }
            sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// Wait until every partition has elected a leader
    pub async fn wait_for_leaders(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for partition in self.inner.router.partitions() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.wait_for_leader(partition, remaining).await?;
        }
        Ok(())
    }

    pub async fn status(&self, node: NodeId, partition: PartitionId) -> Result<RaftStatus> {
        match self.inner.call(node, partition, Request::Status).await? {
            Response::Status(status) => Ok(status),
            other => Err(TrellisError::codec(format!(
                "unexpected response to status request: {:?}",
                other
            ))),
        }
    }

    /// Cut `node` off from every peer and client
    pub fn isolate(&self, node: NodeId) {
        warn!("Isolating node {}", node);
        self.inner.transport.isolate(node);
    }

    pub fn heal(&self, node: NodeId) {
        info!("Healing node {}", node);
        self.inner.transport.heal(node);
    }

    /// Submit a membership change to the leader of `partition`, retrying
    /// across leader changes until `timeout`
    async fn change_membership(
        &self,
        partition: PartitionId,
        request: Request,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let leader = self.wait_for_leader(partition, remaining).await?;
            // A change that timed out may still have been applied
            if let Ok(status) = self.status(leader, partition).await {
                let applied = match &request {
                    Request::AddReplica { node } => status.voters.contains(node),
                    Request::RemoveReplica { node } => !status.voters.contains(node),
                    _ => false,
                };
                if applied {
                    return Ok(());
                }
            }
            match self.inner.call(leader, partition, request.clone()).await {
                Ok(_) => return Ok(()),
                Err(e)
                    if e.is_retriable()
                        || matches!(
                            e,
                            TrellisError::IllegalArgument { .. } | TrellisError::Shutdown
                        ) =>
                {
                    // A fresh leader refuses changes until its first entry commits
                    debug!(
                        "Membership change {} on partition {} retrying: {}",
                        request.kind(),
                        partition,
                        e
                    );
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    sleep(LEADER_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Start `node` as a learner of every partition and add it as a voter
    pub async fn add_replica(&self, node: NodeId) -> Result<()> {
        if self.inner.nodes.lock().await.contains_key(&node) {
            return Err(TrellisError::illegal_argument(format!(
                "node {} is already running",
                node
            )));
        }
        self.launch(node, &Membership::default()).await?;
        let timeout = self.admin_timeout();
        for partition in self.inner.router.partitions() {
            self.change_membership(partition, Request::AddReplica { node }, timeout)
                .await?;
            let mut replicas = self.inner.router.replicas(partition);
            replicas.push(node);
            self.inner.router.set_replicas(partition, replicas);
        }
        info!("Node {} added to every partition", node);
        Ok(())
    }

    /// Remove `node` from every partition's voters and stop it
    pub async fn remove_replica(&self, node: NodeId) -> Result<()> {
        let timeout = self.admin_timeout();
        for partition in self.inner.router.partitions() {
            self.change_membership(partition, Request::RemoveReplica { node }, timeout)
                .await?;
            let mut replicas = self.inner.router.replicas(partition);
            replicas.retain(|r| *r != node);
            self.inner.router.set_replicas(partition, replicas);
        }
        self.stop_node(node).await;
        info!("Node {} removed from every partition", node);
        Ok(())
    }

    /// Stop `node` without changing membership
    pub async fn stop_node(&self, node: NodeId) {
        let stopped = self.inner.nodes.lock().await.remove(&node);
        if let Some(stopped) = stopped {
            for partition in self.inner.router.partitions() {
                self.inner.handles.remove(&(node, partition));
            }
            stopped.stop(&self.inner.transport).await;
        }
    }

    /// Restart a stopped node over its existing logs
    ///
    /// With memory storage the replica comes back empty and is caught up by
    /// the leader.
    pub async fn restart_node(&self, node: NodeId) -> Result<()> {
        self.stop_node(node).await;
        let partitions = self.inner.router.partitions();
        let voters = partitions
            .first()
            .map(|p| self.inner.router.replicas(*p))
            .unwrap_or_default();
        self.launch(node, &Membership::new(voters)).await
    }

    fn admin_timeout(&self) -> Duration {
        self.inner.config.raft.rpc_timeout() * 10
    }

    /// Stop every node
    pub async fn shutdown(&self) {
        let nodes: Vec<Node> = {
            let mut guard = self.inner.nodes.lock().await;
            std::mem::take(&mut *guard).into_values().collect()
        };
        self.inner.handles.clear();
        let transport = &self.inner.transport;
        join_all(nodes.into_iter().map(|node| node.stop(transport))).await;
        info!("Cluster stopped");
    }
}
