//! Primitive state machine services
//!
//! A service is the replicated state behind one named primitive instance
//! (a map, a counter, a lock, ...). Services are pure functions of the
//! applied command stream: the `ApplyContext` is the only environment they
//! see, and the entry timestamp in it is their only clock.

pub mod counter;
pub mod election;
pub mod lock;
pub mod map;
pub mod queue;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use trellis_common::{CompactionMode, DomainError, Index, Result, SessionId, TrellisError};

/// Output of a primitive operation: encoded value or domain outcome
pub type OperationResult = std::result::Result<Vec<u8>, DomainError>;

/// Environment of a single apply or query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    /// Index of the entry being applied, or the applied index for queries
    pub index: Index,
    /// Entry timestamp in milliseconds
    pub timestamp: u64,
    /// Session that issued the operation
    pub session: Option<SessionId>,
}

impl ApplyContext {
    pub fn require_session(&self) -> std::result::Result<SessionId, DomainError> {
        self.session
            .ok_or_else(|| DomainError::invalid_operation("operation requires a session"))
    }
}

/// Replicated state of one primitive instance
pub trait StateMachineService: Send {
    fn service_type(&self) -> &'static str;

    /// Apply a command, returning its output and the retention its entry
    /// needs beyond the snapshot
    fn apply(&mut self, ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode);

    /// Evaluate a read-only operation
    fn query(&self, ctx: &ApplyContext, payload: &[u8]) -> OperationResult;

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(&mut self, data: &[u8]) -> Result<()>;

    /// Release everything the session held; called on close and on expiry
    fn session_expired(&mut self, _ctx: &ApplyContext, _session: SessionId) {}
}

/// Constructor of empty service instances
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn StateMachineService> + Send + Sync>;

/// Service type name to factory mapping, shared by every partition
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: BTreeMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the map, counter, lock, leader-election and work-queue
    /// services
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(map::SERVICE_TYPE, || Box::new(map::MapService::default()));
        registry.register(counter::SERVICE_TYPE, || {
            Box::new(counter::CounterService::default())
        });
        registry.register(lock::SERVICE_TYPE, || Box::new(lock::LockService::default()));
        registry.register(election::SERVICE_TYPE, || {
            Box::new(election::ElectionService::default())
        });
        registry.register(queue::SERVICE_TYPE, || {
            Box::new(queue::WorkQueueService::default())
        });
        registry
    }

    /// Register a service type, replacing any previous factory of that name
    pub fn register<F>(&mut self, service_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StateMachineService> + Send + Sync + 'static,
    {
        let service_type = service_type.into();
        info!("Registered primitive service type '{}'", service_type);
        self.factories.insert(service_type, Arc::new(factory));
    }

    pub fn contains(&self, service_type: &str) -> bool {
        self.factories.contains_key(service_type)
    }

    pub fn service_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Create an empty instance of `service_type`
    pub fn create(&self, service_type: &str) -> Result<Box<dyn StateMachineService>> {
        self.factories
            .get(service_type)
            .map(|factory| factory())
            .ok_or_else(|| TrellisError::UnknownPrimitiveType {
                name: service_type.to_string(),
            })
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("service_types", &self.service_types())
            .finish()
    }
}

/// Encode an operation for submission
pub fn encode_operation<T: Serialize>(operation: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(operation)?)
}

/// Decode a successful operation output
pub fn decode_output<T: DeserializeOwned>(output: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(output)?)
}

/// Decode an operation inside a service
pub(crate) fn decode_operation<T: DeserializeOwned>(
    payload: &[u8],
) -> std::result::Result<T, DomainError> {
    serde_json::from_slice(payload)
        .map_err(|e| DomainError::invalid_operation(format!("malformed operation: {}", e)))
}

/// Encode an operation output inside a service
pub(crate) fn encode_output<T: Serialize>(value: &T) -> OperationResult {
    serde_json::to_vec(value)
        .map_err(|e| DomainError::illegal_state(format!("unencodable output: {}", e)))
}
