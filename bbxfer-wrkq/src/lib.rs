//! Per-volume work queues for burst-buffer transfers.
//!
//! Every logical volume under active data movement gets a work queue: a FIFO
//! of extent transfers gated by a byte-rate throttle. Transfer threads pick a
//! dispatchable queue, pop the front item, charge its length against the
//! queue's bucket, and sleep off any debt before moving the data. It includes:
//!
//! - **Locked FIFO**: Strict arrival order under an owner-tracking lock.
//! - **Token-bucket throttle**: Bytes per second with carried debt.
//! - **Suspend flag**: Stops dispatch without rejecting new work.
//! - **Manager and replenish task**: Registry plus the periodic bucket load.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      WorkQueueManager                           │
//! │                                                                 │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ WorkQueue (one per LvKey)                                 │  │
//! │  │  ┌────────────┐   ┌──────────────┐   ┌────────────────┐  │  │
//! │  │  │ QueueLock  │──▶│  LockedFifo  │   │    Throttle    │  │  │
//! │  │  └────────────┘   └──────────────┘   │  (ByteBucket)  │  │  │
//! │  │                                      └────────────────┘  │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │                              ▲                                  │
//! │                   replenish_task (load_buckets)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # DST Compatibility
//!
//! All time-dependent operations accept `current_time_us` as a parameter rather
//! than reading the system clock. Production code feeds them from a
//! [`MonotonicClock`]; tests drive time by hand.
//!
//! # Example
//!
//! ```rust
//! use bbxfer_core::{ContribId, ExtentInfo, JobId, LvInfoHandle, LvKey, TagId, TransferHandle};
//! use bbxfer_wrkq::{WorkQueueManager, WorkQueueManagerConfig};
//!
//! let manager = WorkQueueManager::new(WorkQueueManagerConfig::for_testing()).unwrap();
//! let lv = LvKey::new("/dev/bb/lv0", uuid::Uuid::new_v4()).unwrap();
//! manager.add_work_queue(lv.clone(), LvInfoHandle::new(1), JobId::new(7), false, 0).unwrap();
//! manager.set_throttle_rate(&lv, 1_000, 0).unwrap();
//! manager.add_work_item(&lv, TransferHandle::new(1), ContribId::new(0)).unwrap();
//! manager.load_buckets(500_000).unwrap();
//!
//! // Transfer thread.
//! let queue = manager.get(&lv).unwrap();
//! let guard = queue.lock_guard("transfer").unwrap();
//! assert!(guard.is_dispatchable());
//! let item = guard.remove_work_item(true).unwrap();
//! let extent = ExtentInfo::new(item.handle, item.contrib_id, 800);
//! let wait = guard.process_bucket(TagId::new(1), &extent).unwrap();
//! assert_eq!(wait.as_millis(), 300);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod locked_fifo;
pub mod manager;
pub mod queue_lock;
pub mod throttle;
pub mod tick;
pub mod token_bucket;
pub mod work_queue;

// Re-export main types for convenience.
pub use config::{WorkQueueConfig, WorkQueueManagerConfig, DEFAULT_THROTTLE_TICK_INTERVAL_US};
pub use error::{WorkQueueError, WorkQueueResult};
pub use locked_fifo::LockedFifo;
pub use manager::WorkQueueManager;
pub use queue_lock::{LockOwner, QueueLock};
pub use throttle::{Throttle, ThrottleState};
pub use tick::{replenish_task, MonotonicClock};
pub use token_bucket::{ByteBucket, Charge};
pub use work_queue::{QueueGuard, QueueSnapshot, TeardownReport, WorkQueue};
