//! Lock state machine service

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trellis_common::{CompactionMode, DomainError, Result, SessionId};

use super::model::{DistributedLock, LockHolder, LockWaiter};
use crate::service::{
    ApplyContext, OperationResult, StateMachineService, decode_operation, encode_output,
};

pub const SERVICE_TYPE: &str = "lock";

/// Lock commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LockCommand {
    /// Acquire the lock. `timeout_ms` of `None` waits until granted,
    /// `Some(0)` fails immediately when held, `Some(t)` waits at most `t`
    /// milliseconds of entry time.
    Lock {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Unlock,
    /// Release the lock whoever holds it
    ForceUnlock,
    /// Leave the wait queue
    CancelWait,
    IsLocked,
    Holder,
}

impl LockCommand {
    pub fn compaction_mode(&self) -> CompactionMode {
        match self {
            LockCommand::Lock {
                timeout_ms: Some(t),
            } if *t > 0 => CompactionMode::Sequential,
            LockCommand::Unlock | LockCommand::CancelWait => CompactionMode::Sequential,
            LockCommand::ForceUnlock => CompactionMode::Full,
            _ => CompactionMode::Quorum,
        }
    }
}

/// Outcome of a lock or cancel-wait command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockResult {
    Acquired { fence_token: u64 },
    Queued { position: usize },
    Unavailable,
}

/// One named lock
#[derive(Debug, Default)]
pub struct LockService {
    lock: DistributedLock,
}

impl LockService {
    fn execute(&mut self, ctx: &ApplyContext, command: LockCommand) -> OperationResult {
        self.lock.expire_waiters(ctx.timestamp);
        match command {
            LockCommand::Lock { timeout_ms } => {
                let session = ctx.require_session()?;
                encode_output(&self.lock_for(ctx, session, timeout_ms))
            }
            LockCommand::Unlock => {
                let session = ctx.require_session()?;
                if !self.lock.release(session) {
                    return Err(DomainError::illegal_state(format!(
                        "session {} does not hold the lock",
                        session
                    )));
                }
                debug!("Lock released by session {} at index {}", session, ctx.index);
                self.grant_next(ctx);
                encode_output(&())
            }
            LockCommand::ForceUnlock => {
                if let Some(holder) = self.lock.force_release() {
                    info!(
                        "Lock held by session {} force released at index {}",
                        holder.session, ctx.index
                    );
                }
                self.grant_next(ctx);
                encode_output(&())
            }
            LockCommand::CancelWait => {
                let session = ctx.require_session()?;
                // The grant may have raced with the waiter giving up.
                if let Some(holder) = self.lock.holder.filter(|h| h.session == session) {
                    return encode_output(&LockResult::Acquired {
                        fence_token: holder.fence_token,
                    });
                }
                self.lock.cancel_wait(session);
                encode_output(&LockResult::Unavailable)
            }
            read => self.read(read),
        }
    }

    fn lock_for(
        &mut self,
        ctx: &ApplyContext,
        session: SessionId,
        timeout_ms: Option<u64>,
    ) -> LockResult {
        if let Some(holder) = self.lock.holder.filter(|h| h.session == session) {
            return LockResult::Acquired {
                fence_token: holder.fence_token,
            };
        }
        if self.lock.acquire(session, ctx.index, ctx.timestamp) {
            debug!("Lock acquired by session {} at index {}", session, ctx.index);
            return LockResult::Acquired {
                fence_token: ctx.index,
            };
        }
        match timeout_ms {
            Some(0) => LockResult::Unavailable,
            timeout => {
                let position = self.lock.enqueue(LockWaiter {
                    session,
                    index: ctx.index,
                    deadline: timeout.map(|t| ctx.timestamp.saturating_add(t)),
                });
                LockResult::Queued { position }
            }
        }
    }

    fn grant_next(&mut self, ctx: &ApplyContext) {
        if let Some(holder) = self.lock.grant_next(ctx.index, ctx.timestamp) {
            debug!(
                "Lock granted to waiting session {} with fence token {}",
                holder.session, holder.fence_token
            );
        }
    }

    fn read(&self, command: LockCommand) -> OperationResult {
        match command {
            LockCommand::IsLocked => encode_output(&self.lock.is_locked()),
            LockCommand::Holder => encode_output(&self.lock.holder),
            other => Err(DomainError::invalid_operation(format!(
                "{:?} must be submitted as a command",
                other
            ))),
        }
    }

    pub fn holder(&self) -> Option<LockHolder> {
        self.lock.holder
    }
}

impl StateMachineService for LockService {
    fn service_type(&self) -> &'static str {
        SERVICE_TYPE
    }

    fn apply(&mut self, ctx: &ApplyContext, payload: &[u8]) -> (OperationResult, CompactionMode) {
        match decode_operation::<LockCommand>(payload) {
            Ok(command) => (self.execute(ctx, command), command.compaction_mode()),
            Err(e) => (Err(e), CompactionMode::Quorum),
        }
    }

    fn query(&self, _ctx: &ApplyContext, payload: &[u8]) -> OperationResult {
        self.read(decode_operation(payload)?)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.lock)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.lock = serde_json::from_slice(data)?;
        Ok(())
    }

    fn session_expired(&mut self, ctx: &ApplyContext, session: SessionId) {
        self.lock.cancel_wait(session);
        if self.lock.release(session) {
            info!(
                "Lock released after session {} ended at index {}",
                session, ctx.index
            );
            self.grant_next(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{decode_output, encode_operation};

    fn ctx(index: u64, timestamp: u64, session: u64) -> ApplyContext {
        ApplyContext {
            index,
            timestamp,
            session: Some(SessionId::new(session)),
        }
    }

    fn run(service: &mut LockService, ctx: ApplyContext, command: LockCommand) -> OperationResult {
        service.apply(&ctx, &encode_operation(&command).unwrap()).0
    }

    fn lock_result(result: OperationResult) -> LockResult {
        decode_output(&result.unwrap()).unwrap()
    }

    #[test]
    fn test_fence_token_is_grant_index() {
        let mut service = LockService::default();
        let result = lock_result(run(
            &mut service,
            ctx(7, 0, 1),
            LockCommand::Lock { timeout_ms: None },
        ));
        assert_eq!(result, LockResult::Acquired { fence_token: 7 });
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        let result = lock_result(run(
            &mut service,
            ctx(2, 0, 2),
            LockCommand::Lock {
                timeout_ms: Some(0),
            },
        ));
        assert_eq!(result, LockResult::Unavailable);
    }

    #[test]
    fn test_unlock_grants_next_waiter() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        let queued = lock_result(run(
            &mut service,
            ctx(2, 0, 2),
            LockCommand::Lock { timeout_ms: None },
        ));
        assert_eq!(queued, LockResult::Queued { position: 1 });

        run(&mut service, ctx(3, 10, 1), LockCommand::Unlock).unwrap();
        let holder = service.holder().unwrap();
        assert_eq!(holder.session, SessionId::new(2));
        assert_eq!(holder.fence_token, 3);
    }

    #[test]
    fn test_unlock_by_non_holder_is_domain_error() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        assert!(matches!(
            run(&mut service, ctx(2, 0, 2), LockCommand::Unlock),
            Err(DomainError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_waiter_deadline_uses_entry_time() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        run(
            &mut service,
            ctx(2, 100, 2),
            LockCommand::Lock {
                timeout_ms: Some(50),
            },
        )
        .unwrap();
        run(&mut service, ctx(3, 200, 1), LockCommand::Unlock).unwrap();
        assert!(service.holder().is_none());
    }

    #[test]
    fn test_session_expiry_releases_lock() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        run(&mut service, ctx(2, 0, 2), LockCommand::Lock { timeout_ms: None }).unwrap();

        service.session_expired(&ctx(5, 100, 1), SessionId::new(1));
        let holder = service.holder().unwrap();
        assert_eq!(holder.session, SessionId::new(2));
        assert_eq!(holder.fence_token, 5);
    }

    #[test]
    fn test_cancel_wait_after_grant_reports_acquired() {
        let mut service = LockService::default();
        run(&mut service, ctx(1, 0, 1), LockCommand::Lock { timeout_ms: None }).unwrap();
        run(&mut service, ctx(2, 0, 2), LockCommand::Lock { timeout_ms: None }).unwrap();
        run(&mut service, ctx(3, 0, 1), LockCommand::Unlock).unwrap();

        let result = lock_result(run(&mut service, ctx(4, 0, 2), LockCommand::CancelWait));
        assert_eq!(result, LockResult::Acquired { fence_token: 3 });
    }

    #[test]
    fn test_compaction_modes() {
        assert_eq!(
            LockCommand::Lock { timeout_ms: None }.compaction_mode(),
            CompactionMode::Quorum
        );
        assert_eq!(
            LockCommand::Lock {
                timeout_ms: Some(1000)
            }
            .compaction_mode(),
            CompactionMode::Sequential
        );
        assert_eq!(LockCommand::Unlock.compaction_mode(), CompactionMode::Sequential);
        assert_eq!(LockCommand::ForceUnlock.compaction_mode(), CompactionMode::Full);
    }
}
