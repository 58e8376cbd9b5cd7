//! Strongly-typed identifiers for burst-buffer transfer entities.
//!
//! Explicit types keep a transfer handle from being passed where a job id
//! is expected. All IDs are 64-bit.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `JobId` with `TransferHandle`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Job identification.
define_id!(JobId, "job", "Identifier of the batch job that owns a transfer.");

// Transfer identification.
define_id!(TransferHandle, "xfer", "Handle of a transfer definition within a job.");
define_id!(ContribId, "contrib", "Identifier of the contributing compute node.");
define_id!(TagId, "tag", "Correlation tag threaded through accounting for diagnostics.");

// Volume descriptor back-reference.
define_id!(
    LvInfoHandle,
    "lvinfo",
    "Non-owning handle (registry index) of a logical-volume descriptor."
);

impl JobId {
    /// Sentinel for queues not yet bound to a job.
    pub const UNDEFINED: Self = Self(u64::MAX);

    /// Returns true unless this is the [`JobId::UNDEFINED`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_defined(self) -> bool {
        self.0 != u64::MAX
    }
}
