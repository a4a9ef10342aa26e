// Typed primitive wrappers
// Encode operations for the built-in services and decode their outputs

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, sleep};
use tracing::debug;

use trellis_common::{
    CompactionMode, Consistency, DomainError, PartitionId, Result, TrellisError,
};

use super::{ClientSession, TrellisClient};
use crate::dispatch::Operation;
use crate::service::counter::{self, CounterOperation};
use crate::service::election::{self, ElectionOperation, Leadership};
use crate::service::lock::{self, LockCommand, LockHolder, LockResult};
use crate::service::map::{self, MapOperation};
use crate::service::queue::{self, QueueOperation, Task, WorkQueueStats};
use crate::service::{OperationResult, decode_output, encode_operation};

/// Named primitive instance on one partition
#[derive(Clone)]
struct Primitive {
    client: TrellisClient,
    name: String,
    service_type: &'static str,
    partition: PartitionId,
    consistency: Consistency,
}

impl Primitive {
    fn new(
        client: TrellisClient,
        name: &str,
        service_type: &'static str,
        partition: PartitionId,
    ) -> Self {
        let consistency = client.config().read_consistency;
        Self {
            client,
            name: name.to_string(),
            service_type,
            partition,
            consistency,
        }
    }

    fn operation<O: Serialize>(&self, operation: &O) -> Result<Operation> {
        Ok(Operation::new(
            self.name.clone(),
            self.service_type,
            encode_operation(operation)?,
        ))
    }

    async fn session(&self) -> Result<ClientSession> {
        self.client.session(self.partition).await
    }

    async fn execute_on<O, T>(
        &self,
        session: &ClientSession,
        operation: &O,
        compaction: CompactionMode,
    ) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned,
    {
        let result = session
            .execute(self.operation(operation)?, compaction)
            .await?;
        decode(result)
    }

    async fn execute<O, T>(&self, operation: &O, compaction: CompactionMode) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned,
    {
        let session = self.session().await?;
        self.execute_on(&session, operation, compaction).await
    }

    async fn query_on<O, T>(&self, session: &ClientSession, operation: &O) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned,
    {
        let result = session
            .query(self.operation(operation)?, self.consistency)
            .await?;
        decode(result)
    }

    async fn query<O, T>(&self, operation: &O) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned,
    {
        let session = self.session().await?;
        self.query_on(&session, operation).await
    }
}

fn decode<T: DeserializeOwned>(result: OperationResult) -> Result<T> {
    decode_output(&result.map_err(TrellisError::Domain)?)
}

/// Replicated string map
#[derive(Clone)]
pub struct DistributedMap {
    primitive: Primitive,
}

impl DistributedMap {
    pub(crate) fn new(client: TrellisClient, name: &str, partition: PartitionId) -> Self {
        Self {
            primitive: Primitive::new(client, name, map::SERVICE_TYPE, partition),
        }
    }

    pub fn name(&self) -> &str {
        &self.primitive.name
    }

    pub fn partition(&self) -> PartitionId {
        self.primitive.partition
    }

    /// Reads of this handle use `consistency`
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.primitive.consistency = consistency;
        self
    }

    async fn command<T: DeserializeOwned>(&self, operation: MapOperation) -> Result<T> {
        let compaction = operation.compaction_mode();
        self.primitive.execute(&operation, compaction).await
    }

    /// Store `value`, returning the previous value
    pub async fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.command(MapOperation::Put {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: None,
        })
        .await
    }

    /// Store `value` until `ttl` of log time has passed
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        self.command(MapOperation::Put {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: Some(ttl.as_millis() as u64),
        })
        .await
    }

    /// Store `value` unless the key exists; returns the existing value
    pub async fn put_if_absent(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.command(MapOperation::PutIfAbsent {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: None,
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<Option<String>> {
        self.command(MapOperation::Remove {
            key: key.to_string(),
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.command(MapOperation::Clear).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.primitive
            .query(&MapOperation::Get {
                key: key.to_string(),
            })
            .await
    }

    pub async fn get_or_default(&self, key: &str, default: &str) -> Result<String> {
        self.primitive
            .query(&MapOperation::GetOrDefault {
                key: key.to_string(),
                default: default.to_string(),
            })
            .await
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        self.primitive
            .query(&MapOperation::ContainsKey {
                key: key.to_string(),
            })
            .await
    }

    pub async fn contains_value(&self, value: &str) -> Result<bool> {
        self.primitive
            .query(&MapOperation::ContainsValue {
                value: value.to_string(),
            })
            .await
    }

    pub async fn size(&self) -> Result<usize> {
        self.primitive.query(&MapOperation::Size).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.primitive.query(&MapOperation::IsEmpty).await
    }
}

/// Replicated 64-bit counter
#[derive(Clone)]
pub struct AtomicCounter {
    primitive: Primitive,
}

impl AtomicCounter {
    pub(crate) fn new(client: TrellisClient, name: &str, partition: PartitionId) -> Self {
        Self {
            primitive: Primitive::new(client, name, counter::SERVICE_TYPE, partition),
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.primitive.consistency = consistency;
        self
    }

    async fn command<T: DeserializeOwned>(&self, operation: CounterOperation) -> Result<T> {
        self.primitive
            .execute(&operation, CompactionMode::Quorum)
            .await
    }

    pub async fn get(&self) -> Result<i64> {
        self.primitive.query(&CounterOperation::Get).await
    }

    pub async fn set(&self, value: i64) -> Result<()> {
        self.command(CounterOperation::Set { value }).await
    }

    pub async fn increment_and_get(&self) -> Result<i64> {
        self.command(CounterOperation::IncrementAndGet).await
    }

    pub async fn get_and_increment(&self) -> Result<i64> {
        self.command(CounterOperation::GetAndIncrement).await
    }

    pub async fn decrement_and_get(&self) -> Result<i64> {
        self.command(CounterOperation::DecrementAndGet).await
    }

    pub async fn get_and_decrement(&self) -> Result<i64> {
        self.command(CounterOperation::GetAndDecrement).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64> {
        self.command(CounterOperation::AddAndGet { delta }).await
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64> {
        self.command(CounterOperation::GetAndAdd { delta }).await
    }

    /// Set to `update` if the current value is `expect`
    pub async fn compare_and_set(&self, expect: i64, update: i64) -> Result<bool> {
        self.command(CounterOperation::CompareAndSet { expect, update })
            .await
    }
}

/// Fenced mutual exclusion lock
///
/// Lock ownership belongs to the client's session on the lock's partition;
/// it is released when that session closes or expires.
#[derive(Clone)]
pub struct DistributedLock {
    primitive: Primitive,
}

impl DistributedLock {
    pub(crate) fn new(client: TrellisClient, name: &str, partition: PartitionId) -> Self {
        Self {
            primitive: Primitive::new(client, name, lock::SERVICE_TYPE, partition),
        }
    }

    async fn request(&self, session: &ClientSession, command: LockCommand) -> Result<LockResult> {
        let compaction = command.compaction_mode();
        self.primitive
            .execute_on(session, &command, compaction)
            .await
    }

    async fn current_holder(&self, session: &ClientSession) -> Result<Option<LockHolder>> {
        self.primitive.query_on(session, &LockCommand::Holder).await
    }

    /// Wait until the lock is granted; returns the fence token
    pub async fn lock(&self) -> Result<u64> {
        let session = self.primitive.session().await?;
        match self
            .request(&session, LockCommand::Lock { timeout_ms: None })
            .await?
        {
            LockResult::Acquired { fence_token } => Ok(fence_token),
            LockResult::Queued { position } => {
                debug!(
                    "Lock {} queued at position {} for session {}",
                    self.primitive.name,
                    position,
                    session.id()
                );
                loop {
                    sleep(self.primitive.client.config().lock_poll_interval()).await;
                    if let Some(fence_token) = self.granted_to(&session).await? {
                        return Ok(fence_token);
                    }
                }
            }
            LockResult::Unavailable => Err(TrellisError::Domain(DomainError::illegal_state(
                "lock refused an unbounded wait",
            ))),
        }
    }

    /// Acquire the lock only if it is free
    pub async fn try_lock(&self) -> Result<Option<u64>> {
        let session = self.primitive.session().await?;
        match self
            .request(&session, LockCommand::Lock {
                timeout_ms: Some(0),
            })
            .await?
        {
            LockResult::Acquired { fence_token } => Ok(Some(fence_token)),
            _ => Ok(None),
        }
    }

    /// Acquire the lock, waiting at most `timeout`
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<Option<u64>> {
        let session = self.primitive.session().await?;
        let deadline = Instant::now() + timeout;
        let command = LockCommand::Lock {
            timeout_ms: Some(timeout.as_millis().max(1) as u64),
        };
        match self.request(&session, command).await? {
            LockResult::Acquired { fence_token } => Ok(Some(fence_token)),
            LockResult::Unavailable => Ok(None),
            LockResult::Queued { .. } => {
                let poll = self.primitive.client.config().lock_poll_interval();
                while Instant::now() < deadline {
                    sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
                    if let Some(fence_token) = self.granted_to(&session).await? {
                        return Ok(Some(fence_token));
                    }
                }
                // The grant may race the cancellation; the service reports it
                match self.request(&session, LockCommand::CancelWait).await? {
                    LockResult::Acquired { fence_token } => Ok(Some(fence_token)),
                    _ => Ok(None),
                }
            }
        }
    }

    async fn granted_to(&self, session: &ClientSession) -> Result<Option<u64>> {
        Ok(self
            .current_holder(session)
            .await?
            .filter(|holder| holder.session == session.id())
            .map(|holder| holder.fence_token))
    }

    /// Release the lock held by this client's session
    pub async fn unlock(&self) -> Result<()> {
        let command = LockCommand::Unlock;
        self.primitive
            .execute(&command, command.compaction_mode())
            .await
    }

    /// Release the lock whoever holds it
    pub async fn force_unlock(&self) -> Result<()> {
        let command = LockCommand::ForceUnlock;
        self.primitive
            .execute(&command, command.compaction_mode())
            .await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.primitive.query(&LockCommand::IsLocked).await
    }

    pub async fn holder(&self) -> Result<Option<LockHolder>> {
        self.primitive.query(&LockCommand::Holder).await
    }
}

/// Leader election among named candidates
#[derive(Clone)]
pub struct LeaderElection {
    primitive: Primitive,
}

impl LeaderElection {
    pub(crate) fn new(client: TrellisClient, name: &str, partition: PartitionId) -> Self {
        Self {
            primitive: Primitive::new(client, name, election::SERVICE_TYPE, partition),
        }
    }

    async fn command(&self, operation: ElectionOperation) -> Result<Leadership> {
        let compaction = operation.compaction_mode();
        self.primitive.execute(&operation, compaction).await
    }

    /// Register `candidate`; it leads when no one else does
    pub async fn run(&self, candidate: &str) -> Result<Leadership> {
        self.command(ElectionOperation::Run {
            candidate: candidate.to_string(),
        })
        .await
    }

    pub async fn withdraw(&self, candidate: &str) -> Result<Leadership> {
        self.command(ElectionOperation::Withdraw {
            candidate: candidate.to_string(),
        })
        .await
    }

    /// Make a registered candidate the leader
    pub async fn anoint(&self, candidate: &str) -> Result<Leadership> {
        self.command(ElectionOperation::Anoint {
            candidate: candidate.to_string(),
        })
        .await
    }

    pub async fn leadership(&self) -> Result<Leadership> {
        self.primitive.query(&ElectionOperation::GetLeadership).await
    }
}

/// Work queue with per-session task ownership
#[derive(Clone)]
pub struct WorkQueue {
    primitive: Primitive,
}

impl WorkQueue {
    pub(crate) fn new(client: TrellisClient, name: &str, partition: PartitionId) -> Self {
        Self {
            primitive: Primitive::new(client, name, queue::SERVICE_TYPE, partition),
        }
    }

    async fn command<T: DeserializeOwned>(&self, operation: QueueOperation) -> Result<T> {
        let compaction = operation.compaction_mode();
        self.primitive.execute(&operation, compaction).await
    }

    /// Enqueue payloads; returns the task ids
    pub async fn add(&self, items: Vec<String>) -> Result<Vec<String>> {
        self.command(QueueOperation::Add { items }).await
    }

    /// Claim up to `max` pending tasks for this client's session
    pub async fn take(&self, max: usize) -> Result<Vec<Task>> {
        self.command(QueueOperation::Take { max }).await
    }

    /// Mark claimed tasks done; returns how many were completed
    pub async fn complete(&self, task_ids: Vec<String>) -> Result<usize> {
        self.command(QueueOperation::Complete { task_ids }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.command(QueueOperation::Clear).await
    }

    pub async fn stats(&self) -> Result<WorkQueueStats> {
        self.primitive.query(&QueueOperation::Stats).await
    }
}
