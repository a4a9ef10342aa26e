//! Atomic counter service

use serde::{Deserialize, Serialize};

use trellis_common::{CompactionMode, DomainError, Result};

use super::{
    ApplyContext, OperationResult, StateMachineService, decode_operation, encode_output,
};

pub const SERVICE_TYPE: &str = "counter";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CounterOperation {
    Get,
    Set { value: i64 },
    IncrementAndGet,
    GetAndIncrement,
    DecrementAndGet,
    GetAndDecrement,
    AddAndGet { delta: i64 },
    GetAndAdd { delta: i64 },
    /// Returns whether the swap happened
    CompareAndSet { expect: i64, update: i64 },
}

/// Signed 64-bit counter with wrapping arithmetic
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterService {
    value: i64,
}

impl CounterService {
    fn add(&mut self, delta: i64) -> (i64, i64) {
        let previous = self.value;
        self.value = previous.wrapping_add(delta);
        (previous, self.value)
    }
}

impl StateMachineService for CounterService {
    fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    fn apply(&mut self, _ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode) {
        let operation = match decode_operation::<CounterOperation>(payload) {
            Ok(operation) => operation,
            Err(e) => return (Err(e), CompactionMode::Quorum),
        };
        let result = match operation {
            CounterOperation::Get => encode_output(&self.value),
            CounterOperation::Set { value } => {
                self.value = value;
                encode_output(&())
            }
            CounterOperation::IncrementAndGet => encode_output(&self.add(1).1),
            CounterOperation::GetAndIncrement => encode_output(&self.add(1).0),
            CounterOperation::DecrementAndGet => encode_output(&self.add(-1).1),
            CounterOperation::GetAndDecrement => encode_output(&self.add(-1).0),
            CounterOperation::AddAndGet { delta } => encode_output(&self.add(delta).1),
            CounterOperation::GetAndAdd { delta } => encode_output(&self.add(delta).0),
            CounterOperation::CompareAndSet { expect, update } => {
                let swapped = self.value == expect;
                if swapped {
                    self.value = update;
                }
                encode_output(&swapped)
            }
        };
        // The whole state is one value: any snapshot supersedes every entry.
        (result, CompactionMode::Quorum)
    }

    fn query(&self, _ctx: &ApplyContext, payload: &[u8]) -> OperationResult {
        match decode_operation::<CounterOperation>(payload)? {
            CounterOperation::Get => encode_output(&self.value),
            other => Err(DomainError::invalid_operation(format!(
                "{:?} must be submitted as a command",
                other
            ))),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(data)?;
        Ok(())
    }
}
