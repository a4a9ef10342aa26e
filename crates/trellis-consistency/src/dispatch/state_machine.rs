// Partition state machine
// Applies committed entries strictly in index order: session bookkeeping,
// duplicate suppression, service dispatch and result caching. Everything in
// here is a pure function of the entry sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trellis_common::{
    CompactionMode, DomainError, Index, PartitionId, Result, SessionId, TrellisError,
};

use super::command::{LogCommand, Operation};
use crate::raft::{EntryPayload, LogEntry};
use crate::service::{
    ApplyContext, OperationResult, ServiceRegistry, StateMachineService,
};
use crate::session::{SequenceCheck, SessionManager};

/// Successful result of applying one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResponse {
    /// Entry with nothing to report (term start, configuration, keep-alive)
    Unit,
    SessionOpened(SessionId),
    Output(OperationResult),
}

/// Result of applying the entry at `index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub index: Index,
    pub result: Result<ApplyResponse>,
}

struct PrimitiveInstance {
    service_type: String,
    service: Box<dyn StateMachineService>,
}

#[derive(Serialize, Deserialize)]
struct ServiceImage {
    service_type: String,
    data: Vec<u8>,
}

/// Serialized image of the whole partition state
#[derive(Serialize, Deserialize)]
struct PartitionImage {
    applied_index: Index,
    last_timestamp: u64,
    sessions: SessionManager,
    services: BTreeMap<String, ServiceImage>,
    retained: BTreeMap<Index, CompactionMode>,
}

/// Replicated state of one partition
pub struct PartitionStateMachine {
    partition: PartitionId,
    registry: Arc<ServiceRegistry>,
    sessions: SessionManager,
    services: BTreeMap<String, PrimitiveInstance>,
    applied_index: Index,
    last_timestamp: u64,
    /// Entries that need more than QUORUM retention, by index
    retained: BTreeMap<Index, CompactionMode>,
}

impl PartitionStateMachine {
    pub fn new(partition: PartitionId, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            partition,
            registry,
            sessions: SessionManager::new(),
            services: BTreeMap::new(),
            applied_index: 0,
            last_timestamp: 0,
            retained: BTreeMap::new(),
        }
    }

    pub fn applied_index(&self) -> Index {
        self.applied_index
    }

    /// Timestamp of the last applied entry
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn retained(&self) -> &BTreeMap<Index, CompactionMode> {
        &self.retained
    }

    /// Forget retention requirements of entries no longer in the log
    pub fn release_retained(&mut self, upto: Index) {
        self.retained = self.retained.split_off(&(upto + 1));
    }

    /// Apply the next committed entry
    pub fn apply(&mut self, entry: &LogEntry) -> ApplyOutcome {
        if entry.index <= self.applied_index {
            warn!(
                "Partition {} skipping entry {} already covered by applied index {}",
                self.partition, entry.index, self.applied_index
            );
            return ApplyOutcome {
                index: entry.index,
                result: Ok(ApplyResponse::Unit),
            };
        }
        self.applied_index = entry.index;
        self.last_timestamp = self.last_timestamp.max(entry.timestamp);

        let (result, mode) = match &entry.payload {
            EntryPayload::TermStart => {
                // Sessions must not expire because of the election gap.
                self.sessions.reset_keep_alives(entry.timestamp);
                (Ok(ApplyResponse::Unit), CompactionMode::Quorum)
            }
            EntryPayload::Configuration(membership) => {
                info!(
                    "Partition {} applied configuration {:?} at index {}",
                    self.partition, membership.voters, entry.index
                );
                (Ok(ApplyResponse::Unit), CompactionMode::Quorum)
            }
            EntryPayload::Command(data) => match LogCommand::decode(data) {
                Ok(command) => self.apply_command(entry, command),
                Err(e) => {
                    warn!(
                        "Partition {} cannot decode command at index {}: {}",
                        self.partition, entry.index, e
                    );
                    (Err(e), CompactionMode::Quorum)
                }
            },
        };

        let mode = mode.max(entry.compaction);
        if mode > CompactionMode::Quorum {
            self.retained.insert(entry.index, mode);
        }
        metrics::counter!("trellis_applied_entries_total", "partition" => self.partition.to_string())
            .increment(1);

        ApplyOutcome {
            index: entry.index,
            result,
        }
    }

    fn apply_command(
        &mut self,
        entry: &LogEntry,
        command: LogCommand,
    ) -> (Result<ApplyResponse>, CompactionMode) {
        let timestamp = entry.timestamp;
        match command {
            LogCommand::OpenSession { client, timeout_ms } => {
                let id = self.sessions.open(entry.index, client, timeout_ms, timestamp);
                (Ok(ApplyResponse::SessionOpened(id)), CompactionMode::Quorum)
            }
            LogCommand::KeepAlive {
                session,
                command_ack,
            } => (
                self.sessions
                    .keep_alive(session, command_ack, timestamp)
                    .map(|_| ApplyResponse::Unit),
                CompactionMode::Quorum,
            ),
            LogCommand::CloseSession { session } => match self.sessions.close(session) {
                Ok(_) => {
                    self.release_session(entry, session);
                    (Ok(ApplyResponse::Unit), CompactionMode::Sequential)
                }
                Err(e) => (Err(e), CompactionMode::Quorum),
            },
            LogCommand::ExpireSession { session } => {
                if self.sessions.expire_if_stale(session, timestamp).is_some() {
                    metrics::counter!("trellis_sessions_expired_total", "partition" => self.partition.to_string())
                        .increment(1);
                    self.release_session(entry, session);
                    (Ok(ApplyResponse::Unit), CompactionMode::Sequential)
                } else {
                    (Ok(ApplyResponse::Unit), CompactionMode::Quorum)
                }
            }
            LogCommand::Command {
                session,
                seq,
                ack,
                operation,
            } => self.apply_operation(entry, session, seq, ack, operation),
        }
    }

    fn apply_operation(
        &mut self,
        entry: &LogEntry,
        session: SessionId,
        seq: u64,
        ack: u64,
        operation: Operation,
    ) -> (Result<ApplyResponse>, CompactionMode) {
        match self.sessions.check_sequence(session, seq) {
            Ok(SequenceCheck::Fresh) => {}
            Ok(SequenceCheck::Duplicate(cached)) => {
                debug!(
                    "Partition {} session {} command {} is a duplicate of index {}",
                    self.partition, session, seq, cached.index
                );
                metrics::counter!("trellis_duplicate_commands_total", "partition" => self.partition.to_string())
                    .increment(1);
                // A retry is still proof of life.
                let result = self
                    .sessions
                    .touch(session, entry.timestamp)
                    .and_then(|_| cached.result.map(ApplyResponse::Output));
                return (result, CompactionMode::Quorum);
            }
            Ok(SequenceCheck::Gap { expected }) => {
                return (
                    Err(TrellisError::SequenceGap {
                        expected,
                        received: seq,
                    }),
                    CompactionMode::Quorum,
                );
            }
            Err(e) => return (Err(e), CompactionMode::Quorum),
        }

        let ctx = ApplyContext {
            index: entry.index,
            timestamp: entry.timestamp,
            session: Some(session),
        };
        let (result, mode) = if let Some(mismatch) = self.type_mismatch(&operation) {
            (Ok(Err(mismatch)), CompactionMode::Quorum)
        } else {
            match self.instance_mut(&operation) {
                Ok(instance) => {
                    let (output, mode) = instance.service.apply(&ctx, &operation.payload);
                    (Ok(output), mode)
                }
                Err(e) => (Err(e), CompactionMode::Quorum),
            }
        };

        if let Err(e) = self.sessions.record_result(
            session,
            seq,
            ack,
            entry.index,
            entry.timestamp,
            result.clone(),
        ) {
            return (Err(e), CompactionMode::Quorum);
        }
        (result.map(ApplyResponse::Output), mode)
    }

    fn instance_mut(&mut self, operation: &Operation) -> Result<&mut PrimitiveInstance> {
        if !self.services.contains_key(&operation.primitive) {
            let service = self.registry.create(&operation.service_type)?;
            debug!(
                "Partition {} created {} primitive '{}'",
                self.partition, operation.service_type, operation.primitive
            );
            self.services.insert(
                operation.primitive.clone(),
                PrimitiveInstance {
                    service_type: operation.service_type.clone(),
                    service,
                },
            );
        }
        self.services
            .get_mut(&operation.primitive)
            .ok_or_else(|| TrellisError::UnknownPrimitiveType {
                name: operation.service_type.clone(),
            })
    }

    /// A primitive name is bound to the service type that first used it
    fn type_mismatch(&self, operation: &Operation) -> Option<DomainError> {
        let instance = self.services.get(&operation.primitive)?;
        (instance.service_type != operation.service_type).then(|| {
            DomainError::illegal_state(format!(
                "primitive '{}' is a {}, not a {}",
                operation.primitive, instance.service_type, operation.service_type
            ))
        })
    }

    fn release_session(&mut self, entry: &LogEntry, session: SessionId) {
        let ctx = ApplyContext {
            index: entry.index,
            timestamp: entry.timestamp,
            session: Some(session),
        };
        for instance in self.services.values_mut() {
            instance.service.session_expired(&ctx, session);
        }
    }

    /// Evaluate a read against the applied state
    pub fn query(&self, session: SessionId, operation: &Operation) -> Result<OperationResult> {
        self.sessions.ensure_open(session)?;
        if let Some(mismatch) = self.type_mismatch(operation) {
            return Ok(Err(mismatch));
        }
        let ctx = ApplyContext {
            index: self.applied_index,
            timestamp: self.last_timestamp,
            session: Some(session),
        };
        match self.services.get(&operation.primitive) {
            Some(instance) => Ok(instance.service.query(&ctx, &operation.payload)),
            // Never written: answer from an empty instance.
            None => Ok(self
                .registry
                .create(&operation.service_type)?
                .query(&ctx, &operation.payload)),
        }
    }

    /// Serialize the complete partition state
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut services = BTreeMap::new();
        for (name, instance) in &self.services {
            services.insert(
                name.clone(),
                ServiceImage {
                    service_type: instance.service_type.clone(),
                    data: instance.service.snapshot()?,
                },
            );
        }
        let image = PartitionImage {
            applied_index: self.applied_index,
            last_timestamp: self.last_timestamp,
            sessions: self.sessions.clone(),
            services,
            retained: self.retained.clone(),
        };
        Ok(serde_json::to_vec(&image)?)
    }

    /// Replace the state with a snapshot image
    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        let image: PartitionImage = serde_json::from_slice(data)
            .map_err(|e| TrellisError::corrupted_snapshot(e.to_string()))?;
        let mut services = BTreeMap::new();
        for (name, image) in image.services {
            let mut service = self.registry.create(&image.service_type)?;
            service.restore(&image.data)?;
            services.insert(
                name,
                PrimitiveInstance {
                    service_type: image.service_type,
                    service,
                },
            );
        }
        self.services = services;
        self.sessions = image.sessions;
        self.applied_index = image.applied_index;
        self.last_timestamp = image.last_timestamp;
        self.retained = image.retained;
        info!(
            "Partition {} restored snapshot at index {} with {} sessions and {} primitives",
            self.partition,
            self.applied_index,
            self.sessions.len(),
            self.services.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for PartitionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStateMachine")
            .field("partition", &self.partition)
            .field("applied_index", &self.applied_index)
            .field("sessions", &self.sessions.len())
            .field("primitives", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Membership;
    use crate::service::map::MapOperation;
    use crate::service::{decode_output, encode_operation};

    struct Harness {
        machine: PartitionStateMachine,
        next_index: Index,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                machine: PartitionStateMachine::new(
                    1,
                    Arc::new(ServiceRegistry::with_builtins()),
                ),
                next_index: 1,
            }
        }

        fn apply_at(&mut self, timestamp: u64, payload: EntryPayload) -> ApplyOutcome {
            let entry = LogEntry {
                index: self.next_index,
                term: 1,
                timestamp,
                compaction: CompactionMode::Quorum,
                payload,
            };
            self.next_index += 1;
            self.machine.apply(&entry)
        }

        fn command(&mut self, timestamp: u64, command: LogCommand) -> ApplyOutcome {
            self.apply_at(timestamp, EntryPayload::Command(command.encode().unwrap()))
        }

        fn open(&mut self) -> SessionId {
            match self
                .command(
                    0,
                    LogCommand::OpenSession {
                        client: "test".to_string(),
                        timeout_ms: 1000,
                    },
                )
                .result
            {
                Ok(ApplyResponse::SessionOpened(id)) => id,
                other => panic!("unexpected {:?}", other),
            }
        }

        fn put(&mut self, session: SessionId, seq: u64, key: &str, value: &str) -> ApplyOutcome {
            let payload = encode_operation(&MapOperation::Put {
                key: key.to_string(),
                value: value.to_string(),
                ttl_ms: None,
            })
            .unwrap();
            self.command(
                10,
                LogCommand::Command {
                    session,
                    seq,
                    ack: seq.saturating_sub(1),
                    operation: Operation::new("m", "map", payload),
                },
            )
        }
    }

    fn previous(outcome: &ApplyOutcome) -> Option<String> {
        match &outcome.result {
            Ok(ApplyResponse::Output(Ok(bytes))) => decode_output(bytes).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_session_id_is_open_index() {
        let mut harness = Harness::new();
        harness.apply_at(0, EntryPayload::TermStart);
        assert_eq!(harness.open(), SessionId::new(2));
    }

    #[test]
    fn test_duplicate_returns_cached_result() {
        let mut harness = Harness::new();
        let session = harness.open();
        let first = harness.put(session, 1, "foo", "bar");
        assert_eq!(previous(&first), None);

        // Retry of the same sequence number: cached null, not "bar".
        let retry = harness.put(session, 1, "foo", "bar");
        assert_eq!(previous(&retry), None);

        let second = harness.put(session, 2, "foo", "baz");
        assert_eq!(previous(&second), Some("bar".to_string()));
    }

    #[test]
    fn test_duplicate_refreshes_keep_alive() {
        let mut harness = Harness::new();
        let session = harness.open();
        let put = harness.put(session, 1, "foo", "bar");
        assert_eq!(previous(&put), None);

        // Only retries arrive; each one still proves the client is alive.
        let payload = encode_operation(&MapOperation::Put {
            key: "foo".to_string(),
            value: "bar".to_string(),
            ttl_ms: None,
        })
        .unwrap();
        let retry = harness.command(
            900,
            LogCommand::Command {
                session,
                seq: 1,
                ack: 0,
                operation: Operation::new("m", "map", payload),
            },
        );
        assert_eq!(previous(&retry), None);
        assert_eq!(harness.machine.sessions().get(session).unwrap().last_keep_alive, 900);

        harness.command(1500, LogCommand::ExpireSession { session });
        assert!(harness.machine.sessions().contains(session));
    }

    #[test]
    fn test_missing_session_is_not_recorded() {
        let mut harness = Harness::new();
        let outcome = harness.put(SessionId::new(42), 1, "foo", "bar");
        assert_eq!(
            outcome.result,
            Err(TrellisError::UnknownSession {
                session: SessionId::new(42)
            })
        );
        assert!(harness.machine.sessions().is_empty());
    }

    #[test]
    fn test_sequence_gap_is_rejected() {
        let mut harness = Harness::new();
        let session = harness.open();
        let outcome = harness.put(session, 3, "foo", "bar");
        assert_eq!(
            outcome.result,
            Err(TrellisError::SequenceGap {
                expected: 1,
                received: 3
            })
        );
        // The gap did not consume the sequence number.
        assert_eq!(previous(&harness.put(session, 1, "foo", "bar")), None);
    }

    #[test]
    fn test_unknown_service_type_is_cached() {
        let mut harness = Harness::new();
        let session = harness.open();
        let outcome = harness.command(
            0,
            LogCommand::Command {
                session,
                seq: 1,
                ack: 0,
                operation: Operation::new("s", "semaphore", vec![]),
            },
        );
        assert!(matches!(
            outcome.result,
            Err(TrellisError::UnknownPrimitiveType { .. })
        ));
        assert!(harness.machine.sessions().get(session).unwrap().results.contains_key(&1));
    }

    #[test]
    fn test_expiry_releases_session_state() {
        let mut harness = Harness::new();
        let session = harness.open();
        let expire = LogCommand::ExpireSession { session };

        // Not stale yet at the entry timestamp: no effect.
        harness.command(500, expire.clone());
        assert!(harness.machine.sessions().contains(session));

        harness.command(1000, expire);
        assert!(!harness.machine.sessions().contains(session));
        assert_eq!(
            harness.put(session, 1, "a", "b").result,
            Err(TrellisError::SessionExpired { session })
        );
        assert_eq!(
            harness.machine.retained().values().copied().collect::<Vec<_>>(),
            vec![CompactionMode::Sequential]
        );
    }

    #[test]
    fn test_term_start_resets_keep_alives() {
        let mut harness = Harness::new();
        let session = harness.open();
        harness.apply_at(900, EntryPayload::TermStart);
        harness.command(1500, LogCommand::ExpireSession { session });
        assert!(harness.machine.sessions().contains(session));
    }

    #[test]
    fn test_query_reads_applied_state() {
        let mut harness = Harness::new();
        let session = harness.open();
        harness.put(session, 1, "foo", "bar");
        let get = Operation::new(
            "m",
            "map",
            encode_operation(&MapOperation::Get {
                key: "foo".to_string(),
            })
            .unwrap(),
        );
        let value: Option<String> =
            decode_output(&harness.machine.query(session, &get).unwrap().unwrap()).unwrap();
        assert_eq!(value.as_deref(), Some("bar"));

        let untouched = Operation::new("other", "map", get.payload.clone());
        let value: Option<String> =
            decode_output(&harness.machine.query(session, &untouched).unwrap().unwrap()).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_dedup() {
        let mut harness = Harness::new();
        let session = harness.open();
        harness.put(session, 1, "foo", "bar");
        harness.apply_at(20, EntryPayload::Configuration(Membership::new([1, 2, 3])));
        let image = harness.machine.snapshot().unwrap();

        let mut restored =
            PartitionStateMachine::new(1, Arc::new(ServiceRegistry::with_builtins()));
        restored.restore(&image).unwrap();
        assert_eq!(restored.applied_index(), harness.machine.applied_index());
        assert_eq!(restored.snapshot().unwrap(), image);

        harness.machine = restored;
        assert_eq!(previous(&harness.put(session, 1, "foo", "zzz")), None);
    }

    #[test]
    fn test_corrupted_image() {
        let mut machine = PartitionStateMachine::new(1, Arc::new(ServiceRegistry::with_builtins()));
        assert!(matches!(
            machine.restore(b"garbage"),
            Err(TrellisError::CorruptedSnapshot { .. })
        ));
    }
}
