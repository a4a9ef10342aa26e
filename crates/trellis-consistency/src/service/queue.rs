//! Work queue service
//!
//! Tasks are taken by sessions and stay in progress until completed. Tasks
//! held by a session that closes or expires go back to the front of the
//! queue.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_common::{CompactionMode, DomainError, Result, SessionId};

use super::{
    ApplyContext, OperationResult, StateMachineService, decode_operation, encode_output,
};

pub const SERVICE_TYPE: &str = "work-queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueOperation {
    /// Enqueue payloads; returns the assigned task ids
    Add { items: Vec<String> },
    /// Take up to `max` pending tasks for the calling session
    Take { max: usize },
    /// Mark tasks owned by the calling session as done
    Complete { task_ids: Vec<String> },
    Stats,
    Clear,
}

impl QueueOperation {
    pub fn compaction_mode(&self) -> CompactionMode {
        match self {
            QueueOperation::Complete { .. } | QueueOperation::Clear => CompactionMode::Sequential,
            _ => CompactionMode::Quorum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Index of the entry that added the task, with its position in the batch
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Assignment {
    task: Task,
    owner: SessionId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkQueueService {
    pending: VecDeque<Task>,
    in_progress: BTreeMap<String, Assignment>,
    completed: u64,
}

impl WorkQueueService {
    fn stats(&self) -> WorkQueueStats {
        WorkQueueStats {
            pending: self.pending.len(),
            in_progress: self.in_progress.len(),
            completed: self.completed,
        }
    }

    fn execute(&mut self, ctx: &ApplyContext, operation: QueueOperation) -> OperationResult {
        match operation {
            QueueOperation::Add { items } => {
                let ids: Vec<String> = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, payload)| {
                        let id = format!("{}-{}", ctx.index, i);
                        self.pending.push_back(Task {
                            id: id.clone(),
                            payload,
                        });
                        id
                    })
                    .collect();
                encode_output(&ids)
            }
            QueueOperation::Take { max } => {
                let owner = ctx.require_session()?;
                let count = max.min(self.pending.len());
                let tasks: Vec<Task> = self.pending.drain(..count).collect();
                for task in &tasks {
                    self.in_progress.insert(
                        task.id.clone(),
                        Assignment {
                            task: task.clone(),
                            owner,
                        },
                    );
                }
                encode_output(&tasks)
            }
            QueueOperation::Complete { task_ids } => {
                let owner = ctx.require_session()?;
                let mut completed = 0usize;
                for id in task_ids {
                    if self.in_progress.get(&id).is_some_and(|a| a.owner == owner) {
                        self.in_progress.remove(&id);
                        completed += 1;
                    }
                }
                self.completed += completed as u64;
                encode_output(&completed)
            }
            QueueOperation::Stats => encode_output(&self.stats()),
            QueueOperation::Clear => {
                self.pending.clear();
                self.in_progress.clear();
                encode_output(&())
            }
        }
    }
}

impl StateMachineService for WorkQueueService {
    fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    fn apply(&mut self, ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode) {
        match decode_operation::<QueueOperation>(payload) {
            Ok(operation) => {
                let mode = operation.compaction_mode();
                (self.execute(ctx, operation), mode)
            }
            Err(e) => (Err(e), CompactionMode::Quorum),
        }
    }

    fn query(&self, _ctx: &ApplyContext, payload: &[u8]) -> OperationResult {
        match decode_operation::<QueueOperation>(payload)? {
            QueueOperation::Stats => encode_output(&self.stats()),
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

    fn session_expired(&mut self, ctx: &ApplyContext, session: SessionId) {
        let owned: Vec<String> = self
            .in_progress
            .iter()
            .filter(|(_, a)| a.owner == session)
            .map(|(id, _)| id.clone())
            .collect();
        // Requeue in reverse so the oldest ends up first.
        for id in owned.iter().rev() {
            if let Some(assignment) = self.in_progress.remove(id) {
                self.pending.push_front(assignment.task);
            }
        }
        if !owned.is_empty() {
            debug!(
                "Returned {} tasks of session {} to the queue at index {}",
                owned.len(),
                session,
                ctx.index
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{decode_output, encode_operation};

    fn ctx(index: u64, session: u64) -> ApplyContext {
        ApplyContext {
            index,
            timestamp: 0,
            session: Some(SessionId::new(session)),
        }
    }

    fn run<T: serde::de::DeserializeOwned>(
        service: &mut WorkQueueService,
        ctx: ApplyContext,
        op: QueueOperation,
    ) -> T {
        let (result, _) = service.apply(&ctx, &encode_operation(&op).unwrap());
        decode_output(&result.unwrap()).unwrap()
    }

    fn add(items: &[&str]) -> QueueOperation {
        QueueOperation::Add {
            items: items.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_take_and_complete() {
        let mut queue = WorkQueueService::default();
        let ids: Vec<String> = run(&mut queue, ctx(4, 1), add(&["a", "b", "c"]));
        assert_eq!(ids, vec!["4-0", "4-1", "4-2"]);

        let tasks: Vec<Task> = run(&mut queue, ctx(5, 2), QueueOperation::Take { max: 2 });
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].payload, "a");

        // Only the owner may complete.
        let foreign: usize = run(
            &mut queue,
            ctx(6, 3),
            QueueOperation::Complete {
                task_ids: vec![tasks[0].id.clone()],
            },
        );
        assert_eq!(foreign, 0);
        let done: usize = run(
            &mut queue,
            ctx(7, 2),
            QueueOperation::Complete {
                task_ids: vec![tasks[0].id.clone()],
            },
        );
        assert_eq!(done, 1);

        let stats: WorkQueueStats = run(&mut queue, ctx(8, 2), QueueOperation::Stats);
        assert_eq!(
            stats,
            WorkQueueStats {
                pending: 1,
                in_progress: 1,
                completed: 1
            }
        );
    }

    #[test]
    fn test_session_expiry_requeues_tasks() {
        let mut queue = WorkQueueService::default();
        let _: Vec<String> = run(&mut queue, ctx(1, 1), add(&["a", "b", "c"]));
        let _: Vec<Task> = run(&mut queue, ctx(2, 2), QueueOperation::Take { max: 2 });

        queue.session_expired(&ctx(3, 2), SessionId::new(2));
        let tasks: Vec<Task> = run(&mut queue, ctx(4, 3), QueueOperation::Take { max: 3 });
        let payloads: Vec<&str> = tasks.iter().map(|t| t.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
    }
}
