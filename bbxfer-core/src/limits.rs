//! System limits and configuration bounds.
//!
//! Every registry has an explicit maximum, and rates stay far below the
//! signed balance range.

use serde::{Deserialize, Serialize};

/// Limits applied by the transfer scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum number of simultaneously registered work queues.
    pub max_work_queues: u32,
    /// Maximum throttle rate in bytes per second.
    pub max_rate_bytes_per_sec: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    ///
    /// 64k volumes, 1 TiB/s.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_work_queues: 65_536,
            max_rate_bytes_per_sec: 1 << 40,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero or exceeds the signed balance range.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_work_queues == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_work_queues",
                reason: "must be positive",
            });
        }

        if self.max_rate_bytes_per_sec == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_rate_bytes_per_sec",
                reason: "must be positive",
            });
        }

        if self.max_rate_bytes_per_sec > i64::MAX.unsigned_abs() {
            return Err(crate::Error::InvalidArgument {
                name: "max_rate_bytes_per_sec",
                reason: "must fit in a signed 64-bit balance",
            });
        }

        Ok(())
    }

    /// Checks a throttle rate against `max_rate_bytes_per_sec`.
    ///
    /// # Errors
    /// Returns `LimitExceeded` if the rate is too large.
    pub const fn check_rate(&self, rate: u64) -> crate::Result<()> {
        if rate > self.max_rate_bytes_per_sec {
            return Err(crate::Error::LimitExceeded {
                limit: "max_rate_bytes_per_sec",
                max: self.max_rate_bytes_per_sec,
                actual: rate,
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
