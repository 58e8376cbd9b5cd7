//! Per-volume work queue.
//!
//! A `WorkQueue` binds one [`LockedFifo`], one [`Throttle`], a suspend flag and
//! the issuing marker to a logical-volume key and a job id. It is the unit the
//! scheduler hands to transfer threads.
//!
//! # Locking
//!
//! FIFO and throttle mutations (`add_work_item`, `remove_work_item`,
//! `set_rate`, `load_bucket`, `process_bucket`) require the calling thread to
//! own the queue lock and fail with `LockNotHeld` otherwise. Take it either
//! explicitly with [`WorkQueue::lock`]/[`WorkQueue::unlock`] or scoped with
//! [`WorkQueue::lock_guard`]. Reads (`wrkq_size`, `is_assignable`, `rate`,
//! `snapshot`) never need it.
//!
//! # Dispatch
//!
//! ```text
//!   try_lock ─▶ is_assignable? ─no─▶ unlock, try another queue
//!                   │yes
//!                   ▼
//!             remove_work_item ─▶ process_bucket ─▶ set_issuing_work_item
//!                   │
//!                unlock ─▶ sleep(wait) ─▶ transfer ─▶ set_issuing_work_item(None)
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bbxfer_core::{ContribId, ExtentInfo, JobId, LvInfoHandle, LvKey, TagId, TransferHandle, WorkId};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn, Level};

use crate::config::WorkQueueConfig;
use crate::error::{WorkQueueError, WorkQueueResult};
use crate::locked_fifo::LockedFifo;
use crate::throttle::Throttle;

// -----------------------------------------------------------------------------
// Snapshot
// -----------------------------------------------------------------------------

/// Point-in-time diagnostic view of a work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Volume key.
    pub lv_key: String,
    /// Owning job.
    pub job_id: u64,
    /// Volume descriptor handle.
    pub lv_info: u64,
    /// Number of queued items.
    pub size: usize,
    /// Rate in bytes per second.
    pub rate: u64,
    /// Token balance.
    pub bucket: i64,
    /// Dispatch is suspended.
    pub suspended: bool,
    /// Explicit do-not-dispatch flag.
    pub throttle_wait: bool,
    /// Bucket is in debt.
    pub negative_bucket: bool,
    /// A transfer thread is sleeping off a throttle wait.
    pub transfer_thread_is_delaying: bool,
    /// Total items ever queued.
    pub number_of_work_items: u64,
    /// Total items popped.
    pub number_of_work_items_processed: u64,
    /// Item currently mid-transfer.
    pub issuing: Option<String>,
    /// Method tag of the current lock holder.
    pub locked_by: Option<&'static str>,
}

impl fmt::Display for QueueSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lv_key={} job={} size={} rate={} bucket={} suspended={} throttle_wait={} \
             negative_bucket={} delaying={} work_items={} processed={} issuing={} locked_by={}",
            self.lv_key,
            self.job_id,
            self.size,
            self.rate,
            self.bucket,
            self.suspended,
            self.throttle_wait,
            self.negative_bucket,
            self.transfer_thread_is_delaying,
            self.number_of_work_items,
            self.number_of_work_items_processed,
            self.issuing.as_deref().unwrap_or("none"),
            self.locked_by.unwrap_or("none"),
        )
    }
}

/// What happened to a queue at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Items still queued, discarded without being processed.
    pub discarded: Vec<WorkId>,
    /// The dump emitted before discarding, if the dump flag was set.
    pub dump: Option<QueueSnapshot>,
    /// Total dumps this queue emitted over its lifetime.
    pub dumps_emitted: u64,
}

// -----------------------------------------------------------------------------
// Work Queue
// -----------------------------------------------------------------------------

/// FIFO of extent transfers for one logical volume, gated by a throttle.
#[derive(Debug)]
pub struct WorkQueue {
    lv_key: LvKey,
    job_id: JobId,
    lv_info: LvInfoHandle,
    fifo: LockedFifo,
    throttle: Throttle,
    /// Read by the scheduler without the queue lock. `Release`/`Acquire`.
    suspended: AtomicBool,
    /// Diagnostic only. `Relaxed`.
    dump_on_remove_work_item: AtomicBool,
    issuing: Mutex<Option<WorkId>>,
    next_seq: AtomicU64,
    dumps_emitted: AtomicU64,
}

impl WorkQueue {
    /// Creates a work queue for a volume.
    ///
    /// # Arguments
    ///
    /// * `lv_key` - Volume key; validated at construction.
    /// * `lv_info` - Handle of the owning volume descriptor.
    /// * `job_id` - Owning job, or `JobId::UNDEFINED`.
    /// * `suspended` - Initial suspend state.
    /// * `config` - Queue configuration.
    /// * `current_time_us` - Current time in microseconds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is invalid.
    pub fn new(
        lv_key: LvKey,
        lv_info: LvInfoHandle,
        job_id: JobId,
        suspended: bool,
        config: &WorkQueueConfig,
        current_time_us: u64,
    ) -> WorkQueueResult<Self> {
        config.validate()?;
        info!(lv_key = %lv_key, job_id = %job_id, lv_info = %lv_info, suspended, "Created work queue");

        Ok(Self {
            lv_key,
            job_id,
            lv_info,
            fifo: LockedFifo::new(),
            throttle: Throttle::new(config.burst_cap_bytes, current_time_us),
            suspended: AtomicBool::new(suspended),
            dump_on_remove_work_item: AtomicBool::new(config.dump_on_remove_work_item),
            issuing: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            dumps_emitted: AtomicU64::new(0),
        })
    }

    /// Returns the volume key.
    #[must_use]
    pub const fn lv_key(&self) -> &LvKey {
        &self.lv_key
    }

    /// Returns the owning job.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Returns the handle of the owning volume descriptor.
    #[must_use]
    pub const fn lv_info(&self) -> LvInfoHandle {
        self.lv_info
    }

    /// Allocates the next queue-scoped work item identifier.
    #[must_use]
    pub fn next_work_id(&self, handle: TransferHandle, contrib_id: ContribId) -> WorkId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        WorkId::new(self.job_id, handle, contrib_id, seq)
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    /// Acquires the queue lock, blocking until it is free.
    ///
    /// # Errors
    ///
    /// Returns `LockReentry` if the calling thread already holds it.
    pub fn lock(&self, method: &'static str) -> WorkQueueResult<()> {
        self.fifo.queue_lock().lock(&self.lv_key, method)
    }

    /// Acquires the queue lock if it is free, without blocking.
    #[must_use]
    pub fn try_lock(&self, method: &'static str) -> bool {
        self.fifo.queue_lock().try_lock(&self.lv_key, method)
    }

    /// Releases the queue lock.
    ///
    /// # Errors
    ///
    /// Returns `LockNotOwned` if the calling thread is not the owner; the lock
    /// stays with its owner.
    pub fn unlock(&self, method: &str) -> WorkQueueResult<()> {
        self.fifo.queue_lock().unlock(&self.lv_key, method)
    }

    /// Acquires the queue lock and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Returns `LockReentry` if the calling thread already holds it.
    pub fn lock_guard(&self, method: &'static str) -> WorkQueueResult<QueueGuard<'_>> {
        self.lock(method)?;
        Ok(QueueGuard {
            queue: self,
            method,
            _not_send: PhantomData,
        })
    }

    /// Like [`WorkQueue::lock_guard`] but returns `None` instead of blocking.
    #[must_use]
    pub fn try_lock_guard(&self, method: &'static str) -> Option<QueueGuard<'_>> {
        self.try_lock(method).then(|| QueueGuard {
            queue: self,
            method,
            _not_send: PhantomData,
        })
    }

    /// Returns true iff the calling thread owns the queue lock.
    #[must_use]
    pub fn transfer_queue_is_locked(&self) -> bool {
        self.fifo.queue_lock().is_held_by_current_caller()
    }

    fn require_lock(&self, method: &'static str) -> WorkQueueResult<()> {
        if self.transfer_queue_is_locked() {
            Ok(())
        } else {
            Err(WorkQueueError::LockNotHeld {
                lv_key: self.lv_key.to_string(),
                method,
            })
        }
    }

    // -------------------------------------------------------------------------
    // FIFO
    // -------------------------------------------------------------------------

    /// Appends a work item. Requires the queue lock.
    ///
    /// Suspended queues accept items like any other.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` without the lock, or `Integrity` if `validate`
    /// finds a duplicate or foreign item.
    pub fn add_work_item(&self, item: WorkId, validate: bool) -> WorkQueueResult<()> {
        self.fifo.push(&self.lv_key, self.job_id, item, validate)?;
        trace!(lv_key = %self.lv_key, work_id = %item, "Added work item");
        Ok(())
    }

    /// Pops the front work item. Requires the queue lock.
    ///
    /// If the dump-on-remove flag is set, the state seen just before a
    /// successful pop is logged. Failed pops are not dumped.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` without the lock, `Empty` if nothing is queued,
    /// or `Integrity` if `validate` finds corruption.
    pub fn remove_work_item(&self, validate: bool) -> WorkQueueResult<WorkId> {
        self.require_lock("remove_work_item")?;
        let before = self.dump_on_remove_work_item().then(|| self.snapshot());
        let item = self.fifo.pop(&self.lv_key, validate)?;
        if let Some(snapshot) = before {
            self.emit_dump(Level::INFO, "remove_work_item", &snapshot);
        }
        trace!(lv_key = %self.lv_key, work_id = %item, "Removed work item");
        Ok(item)
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn wrkq_size(&self) -> usize {
        self.fifo.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    /// Returns the front item without removing it.
    #[must_use]
    pub fn peek_work_item(&self) -> Option<WorkId> {
        self.fifo.front()
    }

    /// Returns a copy of the queued items, front first.
    #[must_use]
    pub fn work_items(&self) -> Vec<WorkId> {
        self.fifo.items_snapshot()
    }

    /// Returns the total number of items ever queued.
    #[must_use]
    pub fn number_of_work_items(&self) -> u64 {
        self.fifo.enqueued()
    }

    /// Returns the total number of items popped.
    #[must_use]
    pub fn number_of_work_items_processed(&self) -> u64 {
        self.fifo.processed()
    }

    // -------------------------------------------------------------------------
    // Throttle
    // -------------------------------------------------------------------------

    /// Returns the rate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.throttle.rate()
    }

    /// Returns the token balance.
    #[must_use]
    pub fn bucket(&self) -> i64 {
        self.throttle.balance()
    }

    /// Sets the rate. Requires the queue lock. A rate of 0 disables throttling
    /// and clears the balance and both blocking flags.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` without the lock.
    pub fn set_rate(&self, rate: u64, current_time_us: u64) -> WorkQueueResult<()> {
        self.require_lock("set_rate")?;
        self.throttle.set_rate(&self.lv_key, rate, current_time_us);
        Ok(())
    }

    /// Loads tokens for the time since the last load. Requires the queue lock.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` without the lock.
    pub fn load_bucket(&self, current_time_us: u64) -> WorkQueueResult<u64> {
        self.require_lock("load_bucket")?;
        Ok(self.throttle.load_bucket(&self.lv_key, current_time_us))
    }

    /// Charges an extent against the bucket. Requires the queue lock.
    ///
    /// # Returns
    ///
    /// How long to wait before dispatching from this queue again.
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` without the lock.
    pub fn process_bucket(&self, tag: TagId, extent: &ExtentInfo) -> WorkQueueResult<Duration> {
        self.require_lock("process_bucket")?;
        Ok(self.throttle.process_bucket(&self.lv_key, tag, extent))
    }

    /// Returns false while the bucket is in debt or the wait flag is set.
    ///
    /// Queue emptiness and suspension are not considered.
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        self.throttle.is_assignable()
    }

    /// Returns true if the queue may be picked for dispatch right now:
    /// not suspended, assignable and non-empty.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        !self.is_suspended() && self.is_assignable() && !self.is_empty()
    }

    /// Sets the explicit do-not-dispatch flag; ignored while the rate is 0.
    ///
    /// # Returns
    ///
    /// The value the flag now holds.
    pub fn set_throttle_wait(&self, value: bool) -> bool {
        self.throttle.set_throttle_wait(value)
    }

    /// Returns the explicit do-not-dispatch flag.
    #[must_use]
    pub fn throttle_wait(&self) -> bool {
        self.throttle.throttle_wait()
    }

    /// Returns true while the bucket is in debt.
    #[must_use]
    pub fn has_negative_bucket(&self) -> bool {
        self.throttle.has_negative_bucket()
    }

    /// Records whether a transfer thread is sleeping off a throttle wait.
    pub fn set_transfer_thread_is_delaying(&self, value: bool) {
        self.throttle.set_transfer_thread_is_delaying(value);
    }

    /// Returns whether a transfer thread is sleeping off a throttle wait.
    #[must_use]
    pub fn transfer_thread_is_delaying(&self) -> bool {
        self.throttle.transfer_thread_is_delaying()
    }

    // -------------------------------------------------------------------------
    // Suspend / issuing
    // -------------------------------------------------------------------------

    /// Returns true if dispatch from this queue is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Suspends or resumes dispatch. Never interrupts the issuing item.
    pub fn set_suspended(&self, value: bool) {
        let old = self.suspended.swap(value, Ordering::AcqRel);
        if old != value {
            info!(lv_key = %self.lv_key, job_id = %self.job_id, suspended = value, "Work queue suspend state changed");
        }
    }

    fn issuing(&self) -> MutexGuard<'_, Option<WorkId>> {
        self.issuing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the item currently mid-transfer, if any.
    #[must_use]
    pub fn issuing_work_item(&self) -> Option<WorkId> {
        *self.issuing()
    }

    /// Sets or clears the issuing marker.
    ///
    /// # Returns
    ///
    /// The previous marker.
    pub fn set_issuing_work_item(&self, item: Option<WorkId>) -> Option<WorkId> {
        std::mem::replace(&mut *self.issuing(), item)
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Returns the dump-on-remove flag.
    #[must_use]
    pub fn dump_on_remove_work_item(&self) -> bool {
        self.dump_on_remove_work_item.load(Ordering::Relaxed)
    }

    /// Sets the dump-on-remove flag.
    pub fn set_dump_on_remove_work_item(&self, value: bool) {
        self.dump_on_remove_work_item.store(value, Ordering::Relaxed);
    }

    /// Returns how many dumps this queue has emitted.
    #[must_use]
    pub fn dumps_emitted(&self) -> u64 {
        self.dumps_emitted.load(Ordering::Relaxed)
    }

    /// Captures the queue state.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let throttle = self.throttle.state();
        // Processed before enqueued; see `LockedFifo` counter ordering.
        let processed = self.fifo.processed();
        let enqueued = self.fifo.enqueued();
        QueueSnapshot {
            lv_key: self.lv_key.to_string(),
            job_id: self.job_id.get(),
            lv_info: self.lv_info.get(),
            size: self.fifo.len(),
            rate: throttle.rate,
            bucket: throttle.bucket,
            suspended: self.is_suspended(),
            throttle_wait: throttle.throttle_wait,
            negative_bucket: throttle.negative_bucket,
            transfer_thread_is_delaying: throttle.transfer_thread_is_delaying,
            number_of_work_items: enqueued,
            number_of_work_items_processed: processed,
            issuing: self.issuing_work_item().map(|item| item.to_string()),
            locked_by: self.fifo.queue_lock().owner().map(|owner| owner.method),
        }
    }

    /// Logs a snapshot at `severity`, prefixed with `prefix`.
    ///
    /// # Returns
    ///
    /// The snapshot that was logged.
    pub fn dump(&self, severity: Level, prefix: &str) -> QueueSnapshot {
        let snapshot = self.snapshot();
        self.emit_dump(severity, prefix, &snapshot);
        snapshot
    }

    fn emit_dump(&self, severity: Level, prefix: &str, snapshot: &QueueSnapshot) {
        self.dumps_emitted.fetch_add(1, Ordering::Relaxed);
        match severity {
            Level::ERROR => error!("{prefix}: {snapshot}"),
            Level::WARN => warn!("{prefix}: {snapshot}"),
            Level::INFO => info!("{prefix}: {snapshot}"),
            Level::DEBUG => debug!("{prefix}: {snapshot}"),
            _ => trace!("{prefix}: {snapshot}"),
        }
    }

    /// Destroys the queue, discarding anything still queued.
    ///
    /// A non-empty queue is logged; with the dump flag set, exactly one full
    /// dump is emitted before the items are discarded. The caller must have
    /// waited for or aborted the issuing item.
    #[must_use]
    pub fn teardown(mut self) -> TeardownReport {
        self.discard_remaining()
    }

    fn discard_remaining(&mut self) -> TeardownReport {
        let mut dump = None;
        if !self.fifo.is_empty() {
            if let Some(item) = self.issuing_work_item() {
                warn!(lv_key = %self.lv_key, work_id = %item, "Work queue destroyed with an item in flight");
            }
            warn!(
                lv_key = %self.lv_key,
                job_id = %self.job_id,
                remaining = self.fifo.len(),
                "Work queue destroyed with queued work items"
            );
            if self.dump_on_remove_work_item() {
                dump = Some(self.dump(Level::INFO, "teardown"));
            }
        }
        let discarded = self.fifo.discard_all();
        TeardownReport {
            discarded,
            dump,
            dumps_emitted: self.dumps_emitted(),
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let _ = self.discard_remaining();
    }
}

// -----------------------------------------------------------------------------
// Guard
// -----------------------------------------------------------------------------

/// Holds a work queue's lock until dropped.
///
/// The guard is `!Send`: the lock must be released by the thread that took it.
pub struct QueueGuard<'a> {
    queue: &'a WorkQueue,
    method: &'static str,
    _not_send: PhantomData<*const ()>,
}

impl Deref for QueueGuard<'_> {
    type Target = WorkQueue;

    fn deref(&self) -> &Self::Target {
        self.queue
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.queue.unlock(self.method) {
            error!(error = %e, "Failed to release work queue guard");
        }
    }
}

impl fmt::Debug for QueueGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueGuard")
            .field("lv_key", self.queue.lv_key())
            .field("method", &self.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use uuid::Uuid;

    use super::*;

    fn queue_with(config: &WorkQueueConfig) -> WorkQueue {
        let key = LvKey::new("/dev/bb/lv0", Uuid::new_v4()).unwrap();
        WorkQueue::new(key, LvInfoHandle::new(3), JobId::new(11), false, config, 0).unwrap()
    }

    fn queue() -> WorkQueue {
        queue_with(&WorkQueueConfig::for_testing())
    }

    fn extent(length: u64) -> ExtentInfo {
        ExtentInfo::new(TransferHandle::new(1), ContribId::new(0), length)
    }

    #[test]
    fn test_fifo_order_a_then_b() {
        let q = queue();
        let a = q.next_work_id(TransferHandle::new(1), ContribId::new(0));
        let b = q.next_work_id(TransferHandle::new(1), ContribId::new(1));

        let guard = q.lock_guard("test").unwrap();
        guard.add_work_item(a, true).unwrap();
        guard.add_work_item(b, true).unwrap();
        assert_eq!(guard.remove_work_item(true).unwrap(), a);
        assert_eq!(guard.remove_work_item(true).unwrap(), b);
        drop(guard);

        assert_eq!(q.number_of_work_items(), 2);
        assert_eq!(q.number_of_work_items_processed(), 2);
        assert!(q.is_empty());
        assert!(!q.transfer_queue_is_locked());
    }

    #[test]
    fn test_mutations_require_lock() {
        let q = queue();
        let item = q.next_work_id(TransferHandle::new(1), ContribId::new(0));

        assert!(matches!(q.add_work_item(item, false), Err(WorkQueueError::LockNotHeld { .. })));
        assert!(matches!(q.remove_work_item(false), Err(WorkQueueError::LockNotHeld { .. })));
        assert!(matches!(q.set_rate(1_000, 0), Err(WorkQueueError::LockNotHeld { .. })));
        assert!(matches!(q.load_bucket(0), Err(WorkQueueError::LockNotHeld { .. })));
        assert!(matches!(
            q.process_bucket(TagId::new(1), &extent(1)),
            Err(WorkQueueError::LockNotHeld { .. })
        ));
    }

    #[test]
    fn test_throttle_example() {
        let q = queue();
        q.lock("test").unwrap();
        q.set_rate(1_000, 0).unwrap();
        q.load_bucket(500_000).unwrap();
        assert_eq!(q.bucket(), 500);

        let wait = q.process_bucket(TagId::new(9), &extent(800)).unwrap();
        assert_eq!(q.bucket(), -300);
        assert!(q.has_negative_bucket());
        assert_eq!(wait, Duration::from_millis(300));
        assert!(!q.is_assignable());

        q.load_bucket(1_500_000).unwrap();
        assert_eq!(q.bucket(), 700);
        assert!(!q.has_negative_bucket());
        assert!(q.is_assignable());
        q.unlock("test").unwrap();
    }

    #[test]
    fn test_set_rate_zero_resets_throttle() {
        let q = queue();
        let guard = q.lock_guard("test").unwrap();
        guard.set_rate(1_000, 0).unwrap();
        guard.process_bucket(TagId::new(1), &extent(10_000)).unwrap();
        guard.set_throttle_wait(true);

        guard.set_rate(0, 1_000).unwrap();
        assert_eq!(guard.rate(), 0);
        assert_eq!(guard.bucket(), 0);
        assert!(!guard.throttle_wait());
        assert!(!guard.has_negative_bucket());
    }

    #[test]
    fn test_assignable_ignores_emptiness() {
        let q = queue();
        assert!(q.is_empty());
        assert!(q.is_assignable());

        let guard = q.lock_guard("test").unwrap();
        guard.set_rate(100, 0).unwrap();
        guard.process_bucket(TagId::new(1), &extent(1_000)).unwrap();
        assert!(guard.is_empty());
        assert!(!guard.is_assignable());

        let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
        guard.add_work_item(item, true).unwrap();
        assert!(!guard.is_assignable());
    }

    #[test]
    fn test_suspended_queue_accepts_work() {
        let q = queue();
        q.set_suspended(true);

        let guard = q.lock_guard("test").unwrap();
        for _ in 0..3 {
            let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
            guard.add_work_item(item, true).unwrap();
        }
        drop(guard);

        assert_eq!(q.wrkq_size(), 3);
        assert!(q.is_assignable());
        assert!(!q.is_dispatchable());

        q.set_suspended(false);
        assert!(q.is_dispatchable());
    }

    #[test]
    fn test_issuing_marker() {
        let q = queue();
        let item = q.next_work_id(TransferHandle::new(1), ContribId::new(0));

        assert_eq!(q.issuing_work_item(), None);
        assert_eq!(q.set_issuing_work_item(Some(item)), None);
        assert_eq!(q.issuing_work_item(), Some(item));

        // Suspending does not touch the in-flight item.
        q.set_suspended(true);
        assert_eq!(q.issuing_work_item(), Some(item));

        assert_eq!(q.set_issuing_work_item(None), Some(item));
        assert_eq!(q.issuing_work_item(), None);
    }

    #[test]
    fn test_dump_snapshot_contents() {
        let q = queue();
        let guard = q.lock_guard("dump_test").unwrap();
        guard.set_rate(2_000, 0).unwrap();
        let item = guard.next_work_id(TransferHandle::new(4), ContribId::new(2));
        guard.add_work_item(item, true).unwrap();

        let snapshot = guard.dump(Level::DEBUG, "test");
        assert_eq!(snapshot.size, 1);
        assert_eq!(snapshot.rate, 2_000);
        assert_eq!(snapshot.bucket, 0);
        assert!(!snapshot.suspended);
        assert_eq!(snapshot.number_of_work_items, 1);
        assert_eq!(snapshot.number_of_work_items_processed, 0);
        assert_eq!(snapshot.job_id, 11);
        assert_eq!(snapshot.lv_info, 3);
        assert_eq!(snapshot.locked_by, Some("dump_test"));
        assert_eq!(q.dumps_emitted(), 1);

        let line = snapshot.to_string();
        assert!(line.contains("size=1"));
        assert!(line.contains("rate=2000"));
    }

    #[test]
    fn test_dump_on_remove() {
        let q = queue_with(&WorkQueueConfig::for_testing().with_dump_on_remove_work_item(true));
        assert!(q.dump_on_remove_work_item());

        let guard = q.lock_guard("test").unwrap();
        for _ in 0..2 {
            let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
            guard.add_work_item(item, false).unwrap();
        }
        guard.remove_work_item(false).unwrap();
        guard.remove_work_item(false).unwrap();
        assert_eq!(guard.dumps_emitted(), 2);

        guard.set_dump_on_remove_work_item(false);
        assert!(matches!(guard.remove_work_item(false), Err(WorkQueueError::Empty { .. })));
        assert_eq!(guard.dumps_emitted(), 2);
    }

    #[test]
    fn test_failed_remove_is_not_dumped() {
        let q = queue_with(&WorkQueueConfig::for_testing().with_dump_on_remove_work_item(true));
        let guard = q.lock_guard("test").unwrap();
        assert!(matches!(guard.remove_work_item(true), Err(WorkQueueError::Empty { .. })));
        assert_eq!(guard.dumps_emitted(), 0);

        let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
        guard.add_work_item(item, false).unwrap();
        guard.add_work_item(item, false).unwrap();
        assert!(matches!(
            guard.remove_work_item(true),
            Err(WorkQueueError::Integrity { .. })
        ));
        assert_eq!(guard.dumps_emitted(), 0);
        assert_eq!(guard.wrkq_size(), 2);
    }

    #[test]
    fn test_teardown_dumps_once() {
        let q = queue_with(&WorkQueueConfig::for_testing().with_dump_on_remove_work_item(true));
        let guard = q.lock_guard("test").unwrap();
        let mut added = Vec::new();
        for _ in 0..3 {
            let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
            guard.add_work_item(item, true).unwrap();
            added.push(item);
        }
        drop(guard);

        let report = q.teardown();
        assert_eq!(report.dumps_emitted, 1);
        let dump = report.dump.unwrap();
        assert_eq!(dump.size, 3);
        assert_eq!(dump.number_of_work_items, 3);
        assert_eq!(report.discarded, added);
    }

    #[test]
    fn test_teardown_without_dump_flag() {
        let q = queue();
        let guard = q.lock_guard("test").unwrap();
        let item = guard.next_work_id(TransferHandle::new(1), ContribId::new(0));
        guard.add_work_item(item, true).unwrap();
        drop(guard);

        assert_eq!(q.work_items(), vec![item]);
        let report = q.teardown();
        assert!(report.dump.is_none());
        assert_eq!(report.dumps_emitted, 0);
        assert_eq!(report.discarded, vec![item]);
    }

    #[test]
    fn test_teardown_empty_queue() {
        let q = queue_with(&WorkQueueConfig::for_testing().with_dump_on_remove_work_item(true));
        let report = q.teardown();
        assert!(report.discarded.is_empty());
        assert!(report.dump.is_none());
    }

    #[test]
    fn test_guard_released_on_drop() {
        let q = Arc::new(queue());
        {
            let _guard = q.lock_guard("scoped").unwrap();
            assert!(q.transfer_queue_is_locked());
        }
        assert!(!q.transfer_queue_is_locked());

        let other = Arc::clone(&q);
        let got = thread::spawn(move || other.try_lock_guard("other").is_some())
            .join()
            .unwrap();
        assert!(got);
    }

    #[test]
    fn test_non_owner_unlock_keeps_lock() {
        let q = Arc::new(queue());
        q.lock("owner").unwrap();

        let other = Arc::clone(&q);
        let err = thread::spawn(move || other.unlock("intruder"))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WorkQueueError::LockNotOwned { .. }));

        assert!(q.transfer_queue_is_locked());
        assert_eq!(q.snapshot().locked_by, Some("owner"));
        q.unlock("owner").unwrap();
    }

    #[test]
    fn test_try_lock_guard_contended() {
        let q = Arc::new(queue());
        let _guard = q.lock_guard("holder").unwrap();

        let other = Arc::clone(&q);
        let got = thread::spawn(move || other.try_lock_guard("other").is_some())
            .join()
            .unwrap();
        assert!(!got);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let key = LvKey::new("/dev/bb/lv0", Uuid::new_v4()).unwrap();
        let config = WorkQueueConfig::for_testing().with_throttle_tick_interval_us(0);
        let result = WorkQueue::new(key, LvInfoHandle::new(0), JobId::UNDEFINED, false, &config, 0);
        assert!(matches!(result, Err(WorkQueueError::InvalidConfig { .. })));
    }

    #[test]
    fn test_snapshot_serializes() {
        let q = queue();
        let json = serde_json::to_value(q.snapshot()).unwrap();
        assert_eq!(json["size"], 0);
        assert_eq!(json["job_id"], 11);
        assert_eq!(json["issuing"], serde_json::Value::Null);
    }
}
