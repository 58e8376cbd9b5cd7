//! Transfer queue lock with recorded ownership.
//!
//! Transfer threads take a queue's lock in one method and release it in
//! another, so the lock is explicit `lock`/`unlock` rather than guard-scoped.
//! The lock records which thread holds it. A release by any other thread is a
//! lock-discipline violation: it is reported and the lock stays with its owner.
//!
//! ```text
//!   lock()  ──▶ owner = current thread ──▶ ... ──▶ unlock() by owner ──▶ free
//!                                              └─▶ unlock() by other ──▶ LockNotOwned,
//!                                                                        owner unchanged
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{error, trace};

use crate::error::{WorkQueueError, WorkQueueResult};

/// Who holds the lock, and from where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    /// Owning thread.
    pub thread: ThreadId,
    /// Method tag passed to `lock`.
    pub method: &'static str,
}

/// A mutual-exclusion lock that records its owning thread.
#[derive(Debug, Default)]
pub struct QueueLock {
    owner: Mutex<Option<LockOwner>>,
    released: Condvar,
}

impl QueueLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Option<LockOwner>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the lock is free, then records the calling thread as owner.
    ///
    /// `lv_key` and `method` are diagnostic tags only.
    ///
    /// # Errors
    ///
    /// Returns `LockReentry` if the calling thread already owns the lock.
    pub fn lock(&self, lv_key: &impl std::fmt::Display, method: &'static str) -> WorkQueueResult<()> {
        let me = thread::current().id();
        let mut owner = self.state();
        loop {
            let current = *owner;
            match current {
                None => break,
                Some(current) if current.thread == me => {
                    error!(lv_key = %lv_key, method, held_by = current.method, "Transfer queue lock re-entered");
                    return Err(WorkQueueError::LockReentry {
                        lv_key: lv_key.to_string(),
                        method: method.to_string(),
                    });
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        *owner = Some(LockOwner { thread: me, method });
        trace!(lv_key = %lv_key, method, "Transfer queue locked");
        Ok(())
    }

    /// Records the calling thread as owner if the lock is free.
    ///
    /// Returns `false` without blocking if another thread holds the lock or
    /// the calling thread already does.
    pub fn try_lock(&self, lv_key: &impl std::fmt::Display, method: &'static str) -> bool {
        let mut owner = self.state();
        if owner.is_some() {
            return false;
        }
        *owner = Some(LockOwner {
            thread: thread::current().id(),
            method,
        });
        trace!(lv_key = %lv_key, method, "Transfer queue locked (try)");
        true
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockNotOwned` if the calling thread is not the recorded owner.
    /// The lock is left untouched in that case.
    pub fn unlock(&self, lv_key: &impl std::fmt::Display, method: &str) -> WorkQueueResult<()> {
        let me = thread::current().id();
        let mut owner = self.state();
        let current = *owner;
        match current {
            Some(current) if current.thread == me => {
                *owner = None;
                drop(owner);
                self.released.notify_one();
                trace!(lv_key = %lv_key, method, "Transfer queue unlocked");
                Ok(())
            }
            other => {
                let owner_desc = other.map_or_else(
                    || "none".to_string(),
                    |o| format!("{:?} ({})", o.thread, o.method),
                );
                error!(lv_key = %lv_key, method, owner = %owner_desc, "Transfer queue unlocked by non-owner");
                Err(WorkQueueError::LockNotOwned {
                    lv_key: lv_key.to_string(),
                    method: method.to_string(),
                    owner: owner_desc,
                })
            }
        }
    }

    /// Returns true iff the calling thread is the recorded owner.
    #[must_use]
    pub fn is_held_by_current_caller(&self) -> bool {
        let me = thread::current().id();
        matches!(*self.state(), Some(owner) if owner.thread == me)
    }

    /// Returns true if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state().is_some()
    }

    /// Returns the current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<LockOwner> {
        *self.state()
    }
}
