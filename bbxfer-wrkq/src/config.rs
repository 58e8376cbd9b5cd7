//! Work queue configuration.

use bbxfer_core::Limits;
use serde::{Deserialize, Serialize};

use crate::error::{WorkQueueError, WorkQueueResult};

/// Default interval between throttle bucket loads (250ms).
pub const DEFAULT_THROTTLE_TICK_INTERVAL_US: u64 = 250_000;

/// Per-queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    /// Initial value of the dump-on-remove diagnostic flag.
    pub dump_on_remove_work_item: bool,

    /// Validate FIFO integrity on every add/remove issued through the manager.
    pub validate_work_queue: bool,

    /// Ceiling on accumulated tokens. `None` keeps accumulation uncapped.
    pub burst_cap_bytes: Option<u64>,

    /// Interval between throttle bucket loads in microseconds.
    pub throttle_tick_interval_us: u64,
}

impl WorkQueueConfig {
    /// Creates a configuration for testing.
    ///
    /// Validation is on and the tick is short.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            dump_on_remove_work_item: false,
            validate_work_queue: true,
            burst_cap_bytes: None,
            throttle_tick_interval_us: 10_000,
        }
    }

    /// Sets the dump-on-remove flag.
    #[must_use]
    pub const fn with_dump_on_remove_work_item(mut self, enabled: bool) -> Self {
        self.dump_on_remove_work_item = enabled;
        self
    }

    /// Sets whether queue integrity is validated.
    #[must_use]
    pub const fn with_validate_work_queue(mut self, enabled: bool) -> Self {
        self.validate_work_queue = enabled;
        self
    }

    /// Caps token accumulation.
    #[must_use]
    pub const fn with_burst_cap_bytes(mut self, cap: u64) -> Self {
        self.burst_cap_bytes = Some(cap);
        self
    }

    /// Sets the throttle tick interval.
    #[must_use]
    pub const fn with_throttle_tick_interval_us(mut self, interval_us: u64) -> Self {
        self.throttle_tick_interval_us = interval_us;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the tick interval or burst cap is zero.
    pub fn validate(&self) -> WorkQueueResult<()> {
        if self.throttle_tick_interval_us == 0 {
            return Err(WorkQueueError::InvalidConfig {
                message: "throttle_tick_interval_us must be positive".to_string(),
            });
        }
        if self.burst_cap_bytes == Some(0) {
            return Err(WorkQueueError::InvalidConfig {
                message: "burst_cap_bytes must be positive when set".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            dump_on_remove_work_item: false,
            validate_work_queue: false,
            burst_cap_bytes: None,
            throttle_tick_interval_us: DEFAULT_THROTTLE_TICK_INTERVAL_US,
        }
    }
}

/// Configuration for the work queue manager.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueManagerConfig {
    /// Configuration applied to every queue the manager creates.
    pub queue: WorkQueueConfig,

    /// Registry and accounting limits.
    pub limits: Limits,
}

impl WorkQueueManagerConfig {
    /// Creates a configuration for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            queue: WorkQueueConfig::for_testing(),
            limits: Limits::new(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue config or the limits are invalid.
    pub fn validate(&self) -> WorkQueueResult<()> {
        self.queue.validate()?;
        self.limits.validate()?;
        Ok(())
    }
}
