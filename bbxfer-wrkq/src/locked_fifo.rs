//! FIFO of work items guarded by the transfer queue lock.
//!
//! Every mutation checks that the calling thread owns the [`QueueLock`]; the
//! inner mutex only keeps the `VecDeque` memory-safe for lock-free readers such
//! as `len()` and diagnostics.
//!
//! # Counters
//!
//! `enqueued` and `processed` are written only while the items mutex is held,
//! with `Release` increments. Readers load `processed` before `enqueued` with
//! `Acquire`, so a reader never observes `processed > enqueued`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bbxfer_core::{JobId, LvKey, WorkId};

use crate::error::{WorkQueueError, WorkQueueResult};
use crate::queue_lock::QueueLock;

/// Ordered container of work items with an owner-tracking lock.
#[derive(Debug, Default)]
pub struct LockedFifo {
    lock: QueueLock,
    items: Mutex<VecDeque<WorkId>>,
    enqueued: AtomicU64,
    processed: AtomicU64,
}

impl LockedFifo {
    /// Creates an empty FIFO.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transfer queue lock.
    #[must_use]
    pub const fn queue_lock(&self) -> &QueueLock {
        &self.lock
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<WorkId>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_lock(&self, lv_key: &LvKey, method: &'static str) -> WorkQueueResult<()> {
        if self.lock.is_held_by_current_caller() {
            Ok(())
        } else {
            Err(WorkQueueError::LockNotHeld {
                lv_key: lv_key.to_string(),
                method,
            })
        }
    }

    /// Appends `item` to the back of the FIFO.
    ///
    /// With `validate`, rejects an item that belongs to another job or whose
    /// sequence number is already queued, and checks the counters against the
    /// queue length. A rejected item is not queued and not counted.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` if the caller does not own the queue lock, or
    /// `Integrity` if validation fails.
    pub fn push(
        &self,
        lv_key: &LvKey,
        job_id: JobId,
        item: WorkId,
        validate: bool,
    ) -> WorkQueueResult<()> {
        self.require_lock(lv_key, "add_work_item")?;
        let mut items = self.items();

        if validate {
            if job_id.is_defined() && item.job_id != job_id {
                return Err(integrity(
                    lv_key,
                    format!("{item} belongs to {}, queue is bound to {job_id}", item.job_id),
                ));
            }
            if items.iter().any(|queued| queued.seq == item.seq) {
                return Err(integrity(lv_key, format!("{item} is already queued")));
            }
            self.check_counters(lv_key, items.len())?;
        }

        items.push_back(item);
        self.enqueued.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Pops the front item.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` if the caller does not own the queue lock,
    /// `Empty` if there is nothing to pop, or `Integrity` if validation fails.
    pub fn pop(&self, lv_key: &LvKey, validate: bool) -> WorkQueueResult<WorkId> {
        self.require_lock(lv_key, "remove_work_item")?;
        let mut items = self.items();

        if validate {
            self.check_counters(lv_key, items.len())?;
        }

        let item = items.pop_front().ok_or_else(|| WorkQueueError::Empty {
            lv_key: lv_key.to_string(),
        })?;

        if validate && items.iter().any(|queued| queued.seq == item.seq) {
            // Put it back so the queue is left as found.
            items.push_front(item);
            return Err(integrity(lv_key, format!("{item} is queued more than once")));
        }

        self.processed.fetch_add(1, Ordering::Release);
        Ok(item)
    }

    fn check_counters(&self, lv_key: &LvKey, len: usize) -> WorkQueueResult<()> {
        let processed = self.processed.load(Ordering::Acquire);
        let enqueued = self.enqueued.load(Ordering::Acquire);
        let len = len as u64;
        if processed > enqueued || enqueued - processed != len {
            return Err(integrity(
                lv_key,
                format!("counters disagree with length: enqueued={enqueued} processed={processed} len={len}"),
            ));
        }
        Ok(())
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Returns the front item without removing it.
    #[must_use]
    pub fn front(&self) -> Option<WorkId> {
        self.items().front().copied()
    }

    /// Returns a copy of the queued items, front first.
    #[must_use]
    pub fn items_snapshot(&self) -> Vec<WorkId> {
        self.items().iter().copied().collect()
    }

    /// Returns the total number of items ever queued.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Returns the total number of items popped.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Takes every queued item without counting them as processed.
    ///
    /// Exclusive access makes the queue lock unnecessary.
    pub fn discard_all(&mut self) -> Vec<WorkId> {
        self.items
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

fn integrity(lv_key: &LvKey, reason: String) -> WorkQueueError {
    WorkQueueError::Integrity {
        lv_key: lv_key.to_string(),
        reason,
    }
}
