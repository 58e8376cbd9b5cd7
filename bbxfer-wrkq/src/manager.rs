//! Registry of per-volume work queues.
//!
//! The manager owns one [`WorkQueue`] per logical volume under active data
//! movement. It creates queues when a volume is registered, tears them down
//! when the volume goes away, and fans the periodic bucket load out to every
//! queue.
//!
//! The registry lock is never held while waiting on a queue lock: queue
//! handles are cloned out first, so volumes never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bbxfer_core::{ContribId, JobId, LvInfoHandle, LvKey, TransferHandle, WorkId};
use tracing::{debug, info, Level};

use crate::config::WorkQueueManagerConfig;
use crate::error::{WorkQueueError, WorkQueueResult};
use crate::work_queue::{QueueSnapshot, TeardownReport, WorkQueue};

// -----------------------------------------------------------------------------
// Work Queue Manager
// -----------------------------------------------------------------------------

/// Registry of work queues keyed by volume.
///
/// # Thread Safety
///
/// The manager is `Send + Sync` and is shared by the request path, the
/// transfer threads and the replenish task.
#[derive(Debug)]
pub struct WorkQueueManager {
    queues: RwLock<HashMap<LvKey, Arc<WorkQueue>>>,
    config: WorkQueueManagerConfig,
}

impl WorkQueueManager {
    /// Creates an empty manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WorkQueueManagerConfig) -> WorkQueueResult<Self> {
        config.validate()?;
        Ok(Self {
            queues: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkQueueManagerConfig {
        &self.config
    }

    /// Returns the interval at which the replenish task should load buckets.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.config.queue.throttle_tick_interval_us)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LvKey, Arc<WorkQueue>>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LvKey, Arc<WorkQueue>>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Creates and registers a work queue for a volume.
    ///
    /// # Errors
    ///
    /// Returns `QueueExists` if the volume already has a queue, or
    /// `LimitExceeded` if the registry is full.
    pub fn add_work_queue(
        &self,
        lv_key: LvKey,
        lv_info: LvInfoHandle,
        job_id: JobId,
        suspended: bool,
        current_time_us: u64,
    ) -> WorkQueueResult<Arc<WorkQueue>> {
        let mut queues = self.write();
        if queues.contains_key(&lv_key) {
            return Err(WorkQueueError::QueueExists {
                lv_key: lv_key.to_string(),
            });
        }

        let max = self.config.limits.max_work_queues;
        if queues.len() >= max as usize {
            return Err(bbxfer_core::Error::LimitExceeded {
                limit: "max_work_queues",
                max: u64::from(max),
                actual: queues.len() as u64 + 1,
            }
            .into());
        }

        let queue = Arc::new(WorkQueue::new(
            lv_key.clone(),
            lv_info,
            job_id,
            suspended,
            &self.config.queue,
            current_time_us,
        )?);
        queues.insert(lv_key, Arc::clone(&queue));
        Ok(queue)
    }

    /// Unregisters and destroys a volume's work queue.
    ///
    /// The queue must have no issuing item and no other live handles; in
    /// either case it stays registered and an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound`, `WorkItemInFlight` or `QueueInUse`.
    pub fn remove_work_queue(&self, lv_key: &LvKey) -> WorkQueueResult<TeardownReport> {
        let mut queues = self.write();
        let queue = queues.get(lv_key).ok_or_else(|| WorkQueueError::QueueNotFound {
            lv_key: lv_key.to_string(),
        })?;

        if let Some(item) = queue.issuing_work_item() {
            return Err(WorkQueueError::WorkItemInFlight {
                lv_key: lv_key.to_string(),
                work_id: item.to_string(),
            });
        }

        let refs = Arc::strong_count(queue) - 1;
        if refs > 0 {
            return Err(WorkQueueError::QueueInUse {
                lv_key: lv_key.to_string(),
                refs,
            });
        }

        let queue = queues
            .remove(lv_key)
            .ok_or_else(|| WorkQueueError::QueueNotFound {
                lv_key: lv_key.to_string(),
            })?;
        drop(queues);

        match Arc::try_unwrap(queue) {
            Ok(queue) => {
                let report = queue.teardown();
                info!(lv_key = %lv_key, discarded = report.discarded.len(), "Removed work queue");
                Ok(report)
            }
            Err(queue) => {
                // A handle was cloned between the count check and the removal.
                let refs = Arc::strong_count(&queue) - 1;
                self.write().insert(lv_key.clone(), queue);
                Err(WorkQueueError::QueueInUse {
                    lv_key: lv_key.to_string(),
                    refs,
                })
            }
        }
    }

    /// Returns the queue for a volume.
    #[must_use]
    pub fn get(&self, lv_key: &LvKey) -> Option<Arc<WorkQueue>> {
        self.read().get(lv_key).cloned()
    }

    /// Returns every registered queue, ordered by volume key.
    #[must_use]
    pub fn queues(&self) -> Vec<Arc<WorkQueue>> {
        let mut queues: Vec<_> = self.read().values().cloned().collect();
        queues.sort_by(|a, b| a.lv_key().cmp(b.lv_key()));
        queues
    }

    /// Returns the number of registered queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no queues are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn require(&self, lv_key: &LvKey) -> WorkQueueResult<Arc<WorkQueue>> {
        self.get(lv_key).ok_or_else(|| WorkQueueError::QueueNotFound {
            lv_key: lv_key.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Request path
    // -------------------------------------------------------------------------

    /// Allocates a work id for an extent transfer and queues it.
    ///
    /// Validation follows `validate_work_queue` in the queue configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound`, or any error from `add_work_item`.
    pub fn add_work_item(
        &self,
        lv_key: &LvKey,
        handle: TransferHandle,
        contrib_id: ContribId,
    ) -> WorkQueueResult<WorkId> {
        let queue = self.require(lv_key)?;
        let guard = queue.lock_guard("add_work_item")?;
        let item = guard.next_work_id(handle, contrib_id);
        guard.add_work_item(item, self.config.queue.validate_work_queue)?;
        Ok(item)
    }

    /// Sets a volume's throttle rate.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound`, or `LimitExceeded` if the rate is above
    /// `max_rate_bytes_per_sec`.
    pub fn set_throttle_rate(
        &self,
        lv_key: &LvKey,
        rate: u64,
        current_time_us: u64,
    ) -> WorkQueueResult<()> {
        self.config.limits.check_rate(rate)?;
        let queue = self.require(lv_key)?;
        let guard = queue.lock_guard("set_throttle_rate")?;
        guard.set_rate(rate, current_time_us)
    }

    /// Returns a volume's throttle rate.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound`.
    pub fn throttle_rate(&self, lv_key: &LvKey) -> WorkQueueResult<u64> {
        Ok(self.require(lv_key)?.rate())
    }

    /// Suspends or resumes every queue owned by a job.
    ///
    /// # Returns
    ///
    /// The number of queues updated.
    pub fn set_job_suspended(&self, job_id: JobId, suspended: bool) -> usize {
        let queues: Vec<_> = self
            .read()
            .values()
            .filter(|q| q.job_id() == job_id)
            .cloned()
            .collect();
        for queue in &queues {
            queue.set_suspended(suspended);
        }
        debug!(job_id = %job_id, suspended, count = queues.len(), "Updated job suspend state");
        queues.len()
    }

    // -------------------------------------------------------------------------
    // Throttle tick
    // -------------------------------------------------------------------------

    /// Loads every queue's bucket for the time elapsed since its last load.
    ///
    /// # Returns
    ///
    /// The number of queues that gained tokens.
    ///
    /// # Errors
    ///
    /// Returns `LockReentry` if the calling thread already holds a queue lock.
    pub fn load_buckets(&self, current_time_us: u64) -> WorkQueueResult<usize> {
        let mut loaded = 0;
        for queue in self.queues() {
            let guard = queue.lock_guard("load_buckets")?;
            if guard.load_bucket(current_time_us)? > 0 {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Dumps every queue at `severity`.
    pub fn dump(&self, severity: Level, prefix: &str) -> Vec<QueueSnapshot> {
        self.queues()
            .iter()
            .map(|queue| queue.dump(severity, prefix))
            .collect()
    }
}
