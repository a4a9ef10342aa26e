//! Distributed map service

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trellis_common::{CompactionMode, DomainError, Index, Result};

use super::{
    ApplyContext, OperationResult, StateMachineService, decode_operation, encode_output,
};

pub const SERVICE_TYPE: &str = "map";

/// Map operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MapOperation {
    /// Returns the previous value
    Put {
        key: String,
        value: String,
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    /// Returns the existing value, or null when the value was stored
    PutIfAbsent {
        key: String,
        value: String,
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    Get {
        key: String,
    },
    GetOrDefault {
        key: String,
        default: String,
    },
    /// Returns the removed value
    Remove {
        key: String,
    },
    ContainsKey {
        key: String,
    },
    ContainsValue {
        value: String,
    },
    Size,
    IsEmpty,
    Clear,
}

impl MapOperation {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            MapOperation::Get { .. }
                | MapOperation::GetOrDefault { .. }
                | MapOperation::ContainsKey { .. }
                | MapOperation::ContainsValue { .. }
                | MapOperation::Size
                | MapOperation::IsEmpty
        )
    }

    /// Entries that can expire or delete keys stay in the log until no
    /// client can retry them
    pub fn compaction_mode(&self) -> CompactionMode {
        match self {
            MapOperation::Put { ttl_ms: Some(_), .. }
            | MapOperation::PutIfAbsent { ttl_ms: Some(_), .. }
            | MapOperation::Remove { .. }
            | MapOperation::Clear => CompactionMode::Sequential,
            _ => CompactionMode::Quorum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MapValue {
    value: String,
    /// Index of the entry that wrote the value
    version: Index,
    expires_at: Option<u64>,
}

impl MapValue {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Key-value map with optional per-key TTL measured on entry timestamps
#[derive(Debug, Default)]
pub struct MapService {
    entries: BTreeMap<String, MapValue>,
}

impl MapService {
    fn live(&self, key: &str, now: u64) -> Option<&MapValue> {
        self.entries.get(key).filter(|v| v.is_live(now))
    }

    fn purge_expired(&mut self, now: u64) {
        self.entries.retain(|_, v| v.is_live(now));
    }

    fn write(&mut self, ctx: &ApplyContext, key: String, value: String, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ttl| ctx.timestamp.saturating_add(ttl));
        self.entries.insert(
            key,
            MapValue {
                value,
                version: ctx.index,
                expires_at,
            },
        );
    }

    fn execute(&mut self, ctx: &ApplyContext, operation: MapOperation) -> OperationResult {
        self.purge_expired(ctx.timestamp);
        match operation {
            MapOperation::Put { key, value, ttl_ms } => {
                let previous = self.entries.get(&key).map(|v| v.value.clone());
                self.write(ctx, key, value, ttl_ms);
                encode_output(&previous)
            }
            MapOperation::PutIfAbsent { key, value, ttl_ms } => {
                if let Some(existing) = self.entries.get(&key) {
                    return encode_output(&Some(existing.value.clone()));
                }
                self.write(ctx, key, value, ttl_ms);
                encode_output(&Option::<String>::None)
            }
            MapOperation::Remove { key } => {
                let removed = self.entries.remove(&key).map(|v| v.value);
                encode_output(&removed)
            }
            MapOperation::Clear => {
                self.entries.clear();
                encode_output(&())
            }
            read => self.read(ctx.timestamp, read),
        }
    }

    fn read(&self, now: u64, operation: MapOperation) -> OperationResult {
        match operation {
            MapOperation::Get { key } => encode_output(&self.live(&key, now).map(|v| &v.value)),
            MapOperation::GetOrDefault { key, default } => encode_output(
                &self
                    .live(&key, now)
                    .map(|v| v.value.clone())
                    .unwrap_or(default),
            ),
            MapOperation::ContainsKey { key } => encode_output(&self.live(&key, now).is_some()),
            MapOperation::ContainsValue { value } => encode_output(
                &self
                    .entries
                    .values()
                    .any(|v| v.is_live(now) && v.value == value),
            ),
            MapOperation::Size => encode_output(&self.live_len(now)),
            MapOperation::IsEmpty => encode_output(&(self.live_len(now) == 0)),
            other => Err(DomainError::invalid_operation(format!(
                "{:?} must be submitted as a command",
                other
            ))),
        }
    }

    fn live_len(&self, now: u64) -> usize {
        self.entries.values().filter(|v| v.is_live(now)).count()
    }
}

impl StateMachineService for MapService {
    fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    fn apply(&mut self, ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode) {
        match decode_operation::<MapOperation>(payload) {
            Ok(operation) => {
                let mode = operation.compaction_mode();
                (self.execute(ctx, operation), mode)
            }
            Err(e) => (Err(e), CompactionMode::Quorum),
        }
    }

    fn query(&self, ctx: &ApplyContext, payload: &[u8]) -> OperationResult {
        let operation = decode_operation::<MapOperation>(payload)?;
        self.read(ctx.timestamp, operation)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.entries = serde_json::from_slice(data)?;
        Ok(())
    }
}
