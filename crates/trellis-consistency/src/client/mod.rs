//! Client surface
//!
//! `TrellisClient` resolves primitives to partitions, opens one session per
//! partition on demand and hides leader changes behind a bounded retry loop.
//! Typed wrappers for the built-in primitives sit on top of it.

pub mod primitives;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info};

use trellis_common::{Consistency, NodeId, PartitionId, Result, TrellisError};

pub use primitives::{AtomicCounter, DistributedLock, DistributedMap, LeaderElection, WorkQueue};
pub use session::{ClientSession, SessionState};

use crate::cluster::ReplicaChannel;
use crate::dispatch::{Request, Response};
use crate::router::Router;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name recorded with every session this client opens
    pub client_id: String,

    /// Session timeout requested from the cluster (default: 5000ms)
    pub session_timeout_ms: u64,

    /// Keep-alive period (default: 1000ms)
    pub keep_alive_interval_ms: u64,

    /// Attempts per request before the last error is returned (default: 50)
    pub retry_attempts: u32,

    /// Pause between attempts once the known replicas are exhausted (default: 20ms)
    pub retry_backoff_ms: u64,

    /// Consistency of primitive reads (default: linearizable)
    pub read_consistency: Consistency,

    /// How often a queued lock request checks for the grant (default: 50ms)
    pub lock_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: format!("client-{:08x}", rand::random::<u32>()),
            session_timeout_ms: 5000,
            keep_alive_interval_ms: 1000,
            retry_attempts: 50,
            retry_backoff_ms: 20,
            read_consistency: Consistency::Linearizable,
            lock_poll_interval_ms: 50,
        }
    }
}

impl ClientConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }
}

/// Request delivery with leader discovery and retries
pub(crate) struct Caller {
    channel: Arc<dyn ReplicaChannel>,
    router: Arc<Router>,
    config: ClientConfig,
    rotation: AtomicUsize,
}

impl Caller {
    fn replicas(&self, partition: PartitionId) -> Result<Vec<NodeId>> {
        let replicas = self.router.replicas(partition);
        if replicas.is_empty() {
            return Err(TrellisError::UnknownPartition { partition });
        }
        Ok(replicas)
    }

    /// Send to the partition leader, following `NotLeader` hints
    ///
    /// The request is resent unchanged, so commands keep their sequence
    /// number across attempts.
    pub(crate) async fn send_to_leader(
        &self,
        partition: PartitionId,
        request: Request,
    ) -> Result<Response> {
        let replicas = self.replicas(partition)?;
        let mut target = self
            .router
            .leader(partition)
            .filter(|leader| replicas.contains(leader))
            .unwrap_or(replicas[0]);
        let mut last_error = TrellisError::NoQuorum;
        for attempt in 0..self.config.retry_attempts.max(1) {
            match self.channel.call(target, partition, request.clone()).await {
                Ok(response) => {
                    self.router.update_leader(partition, Some(target));
                    return Ok(response);
                }
                Err(TrellisError::NotLeader { leader_hint }) => {
                    self.router
                        .observe_error(partition, &TrellisError::NotLeader { leader_hint });
                    target = match leader_hint {
                        Some(hint) if hint != target => hint,
                        _ => {
                            sleep(self.config.retry_backoff()).await;
                            next_replica(&replicas, target)
                        }
                    };
                    last_error = TrellisError::NotLeader { leader_hint };
                }
                Err(e) if e.is_retriable() || matches!(e, TrellisError::Shutdown) => {
                    debug!(
                        "{} on partition {} via node {} failed (attempt {}): {}",
                        request.kind(),
                        partition,
                        target,
                        attempt + 1,
                        e
                    );
                    sleep(self.config.retry_backoff()).await;
                    target = next_replica(&replicas, target);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Send a read to any replica, optionally trying the leader first
    pub(crate) async fn send_to_any(
        &self,
        partition: PartitionId,
        request: Request,
        prefer_leader: bool,
    ) -> Result<Response> {
        let replicas = self.replicas(partition)?;
        let leader = self
            .router
            .leader(partition)
            .filter(|leader| replicas.contains(leader));
        let mut target = match leader {
            Some(leader) if prefer_leader => leader,
            _ => replicas[self.rotation.fetch_add(1, Ordering::Relaxed) % replicas.len()],
        };
        let mut last_error = TrellisError::NoQuorum;
        for _ in 0..self.config.retry_attempts.max(1) {
            match self.channel.call(target, partition, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e)
                    if e.is_retriable() || matches!(e, TrellisError::Shutdown) =>
                {
                    debug!(
                        "Read on partition {} via node {} failed: {}",
                        partition, target, e
                    );
                    target = next_replica(&replicas, target);
                    if target == replicas[0] {
                        sleep(self.config.retry_backoff()).await;
                    }
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}

fn next_replica(replicas: &[NodeId], current: NodeId) -> NodeId {
    let position = replicas.iter().position(|r| *r == current).unwrap_or(0);
    replicas[(position + 1) % replicas.len()]
}

/// Entry point for applications
#[derive(Clone)]
pub struct TrellisClient {
    caller: Arc<Caller>,
    sessions: Arc<DashMap<PartitionId, ClientSession>>,
    opening: Arc<tokio::sync::Mutex<()>>,
}

impl TrellisClient {
    pub fn new(
        channel: Arc<dyn ReplicaChannel>,
        router: Arc<Router>,
        config: ClientConfig,
    ) -> Self {
        Self {
            caller: Arc::new(Caller {
                channel,
                router,
                config,
                rotation: AtomicUsize::new(0),
            }),
            sessions: Arc::new(DashMap::new()),
            opening: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.caller.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.caller.router
    }

    /// Open a new session on `partition`
    ///
    /// The session is independent of the one the client shares between its
    /// primitives on that partition.
    pub async fn open_session(&self, partition: PartitionId) -> Result<ClientSession> {
        let config = &self.caller.config;
        let request = Request::OpenSession {
            client: config.client_id.clone(),
            timeout_ms: config.session_timeout_ms,
        };
        match self.caller.send_to_leader(partition, request).await? {
            Response::SessionOpened { session, index } => {
                info!(
                    "Client {} opened session {} on partition {}",
                    config.client_id, session, partition
                );
                Ok(ClientSession::new(
                    session,
                    partition,
                    index,
                    self.caller.clone(),
                ))
            }
            other => Err(TrellisError::codec(format!(
                "unexpected response to open session: {:?}",
                other
            ))),
        }
    }

    /// Shared session on `partition`, reopened after expiry
    pub async fn session(&self, partition: PartitionId) -> Result<ClientSession> {
        if let Some(session) = self.live_session(partition) {
            return Ok(session);
        }
        let _opening = self.opening.lock().await;
        if let Some(session) = self.live_session(partition) {
            return Ok(session);
        }
        let session = self.open_session(partition).await?;
        self.sessions.insert(partition, session.clone());
        Ok(session)
    }

    fn live_session(&self, partition: PartitionId) -> Option<ClientSession> {
        self.sessions
            .get(&partition)
            .map(|s| s.clone())
            .filter(|s| s.is_open())
    }

    fn partition_of(&self, name: &str) -> Result<PartitionId> {
        Ok(self.caller.router.resolve(name)?.partition)
    }

    pub fn map(&self, name: &str) -> Result<DistributedMap> {
        Ok(DistributedMap::new(self.clone(), name, self.partition_of(name)?))
    }

    pub fn counter(&self, name: &str) -> Result<AtomicCounter> {
        Ok(AtomicCounter::new(self.clone(), name, self.partition_of(name)?))
    }

    pub fn lock(&self, name: &str) -> Result<DistributedLock> {
        Ok(DistributedLock::new(self.clone(), name, self.partition_of(name)?))
    }

    pub fn election(&self, name: &str) -> Result<LeaderElection> {
        Ok(LeaderElection::new(self.clone(), name, self.partition_of(name)?))
    }

    pub fn work_queue(&self, name: &str) -> Result<WorkQueue> {
        Ok(WorkQueue::new(self.clone(), name, self.partition_of(name)?))
    }

    /// Close every shared session
    pub async fn close(&self) -> Result<()> {
        let sessions: Vec<ClientSession> = self.sessions.iter().map(|s| s.clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_replica_wraps() {
        assert_eq!(next_replica(&[1, 2, 3], 1), 2);
        assert_eq!(next_replica(&[1, 2, 3], 3), 1);
        assert_eq!(next_replica(&[1, 2, 3], 9), 2);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.client_id.starts_with("client-"));
        assert_eq!(config.read_consistency, Consistency::Linearizable);
        assert!(config.keep_alive_interval_ms < config.session_timeout_ms);
    }
}
