//! Distributed lock data model

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use trellis_common::{Index, SessionId};

/// Current owner of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub session: SessionId,
    /// Index of the entry that granted the lock; strictly increasing across
    /// grants, used for fencing
    pub fence_token: Index,
    /// Entry timestamp of the grant
    pub acquired_at: u64,
}

/// Session queued behind the holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWaiter {
    pub session: SessionId,
    /// Index of the lock command that queued the session
    pub index: Index,
    /// Entry timestamp after which the waiter gives up; `None` waits forever
    pub deadline: Option<u64>,
}

impl LockWaiter {
    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Distributed lock entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    #[serde(default)]
    pub holder: Option<LockHolder>,
    #[serde(default)]
    pub waiters: VecDeque<LockWaiter>,
}

impl DistributedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    /// Check if the given session holds this lock
    pub fn is_owned_by(&self, session: SessionId) -> bool {
        self.holder.is_some_and(|h| h.session == session)
    }

    /// Position of the session in the wait queue, starting at 1
    pub fn position_of(&self, session: SessionId) -> Option<usize> {
        self.waiters
            .iter()
            .position(|w| w.session == session)
            .map(|p| p + 1)
    }

    /// Acquire the lock for a given session
    pub fn acquire(&mut self, session: SessionId, index: Index, now: u64) -> bool {
        if self.is_locked() {
            return false;
        }
        self.holder = Some(LockHolder {
            session,
            fence_token: index,
            acquired_at: now,
        });
        true
    }

    /// Queue a session behind the holder, returning its position
    pub fn enqueue(&mut self, waiter: LockWaiter) -> usize {
        if let Some(position) = self.position_of(waiter.session) {
            return position;
        }
        self.waiters.push_back(waiter);
        self.waiters.len()
    }

    /// Release the lock held by `session`
    pub fn release(&mut self, session: SessionId) -> bool {
        if !self.is_owned_by(session) {
            return false;
        }
        self.holder = None;
        true
    }

    /// Force release the lock regardless of the holder
    pub fn force_release(&mut self) -> Option<LockHolder> {
        let holder = self.holder;
        self.holder = None;
        holder
    }

    /// Remove a queued session
    pub fn cancel_wait(&mut self, session: SessionId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.session != session);
        before != self.waiters.len()
    }

    /// Drop waiters whose deadline passed at `now`
    pub fn expire_waiters(&mut self, now: u64) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| !w.is_expired(now));
        before - self.waiters.len()
    }

    /// Hand an unlocked lock to the first waiter still within its deadline
    pub fn grant_next(&mut self, index: Index, now: u64) -> Option<LockHolder> {
        if self.is_locked() {
            return None;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_expired(now) {
                continue;
            }
            self.acquire(waiter.session, index, now);
            return self.holder;
        }
        None
    }
}
