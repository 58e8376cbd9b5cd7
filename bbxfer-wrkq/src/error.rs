//! Work queue error types.

/// Work queue error type.
#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    /// `unlock` was called by a thread that is not the recorded owner.
    #[error("lock-discipline violation on {lv_key}: {method} released a lock owned by {owner}")]
    LockNotOwned {
        /// Volume key of the queue.
        lv_key: String,
        /// Method that attempted the release.
        method: String,
        /// Recorded owner (or `none`).
        owner: String,
    },

    /// A mutation that requires the queue lock ran without it.
    #[error("lock-discipline violation on {lv_key}: {method} requires the transfer queue lock")]
    LockNotHeld {
        /// Volume key of the queue.
        lv_key: String,
        /// Method that required the lock.
        method: &'static str,
    },

    /// The owning thread tried to lock again.
    #[error("lock-discipline violation on {lv_key}: {method} re-entered a lock already held by this thread")]
    LockReentry {
        /// Volume key of the queue.
        lv_key: String,
        /// Method that attempted the lock.
        method: String,
    },

    /// Queue validation detected a corrupt or duplicate entry.
    #[error("work queue integrity failure on {lv_key}: {reason}")]
    Integrity {
        /// Volume key of the queue.
        lv_key: String,
        /// What was found.
        reason: String,
    },

    /// `remove_work_item` on an empty queue.
    #[error("work queue for {lv_key} is empty")]
    Empty {
        /// Volume key of the queue.
        lv_key: String,
    },

    /// A work queue is already registered for the volume.
    #[error("work queue for {lv_key} already exists")]
    QueueExists {
        /// Volume key.
        lv_key: String,
    },

    /// No work queue is registered for the volume.
    #[error("work queue for {lv_key} not found")]
    QueueNotFound {
        /// Volume key.
        lv_key: String,
    },

    /// Teardown was requested while a transfer thread still issues an item.
    #[error("work queue for {lv_key} still has {work_id} in flight")]
    WorkItemInFlight {
        /// Volume key.
        lv_key: String,
        /// The issuing item.
        work_id: String,
    },

    /// Teardown was requested while other handles to the queue are alive.
    #[error("work queue for {lv_key} is still referenced by {refs} other handles")]
    QueueInUse {
        /// Volume key.
        lv_key: String,
        /// Number of other live handles.
        refs: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Core validation failed (volume key, limits).
    #[error(transparent)]
    Core(#[from] bbxfer_core::Error),
}

impl WorkQueueError {
    /// Returns true for lock-discipline violations.
    #[must_use]
    pub const fn is_lock_violation(&self) -> bool {
        matches!(
            self,
            Self::LockNotOwned { .. } | Self::LockNotHeld { .. } | Self::LockReentry { .. }
        )
    }
}

/// Result type for work queue operations.
pub type WorkQueueResult<T> = Result<T, WorkQueueError>;
