//! Error types for core value validation.
//!
//! All errors are returned explicitly; nothing is silently clamped.

use std::fmt;

/// The result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while constructing or validating core values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::InvalidArgument {
            name: "lv_key.path",
            reason: "must not be empty",
        };
        assert_eq!(
            format!("{err}"),
            "invalid argument 'lv_key.path': must not be empty"
        );
    }

    #[test]
    fn test_limit_exceeded_display() {
        let err = Error::LimitExceeded {
            limit: "max_work_queues",
            max: 1024,
            actual: 2048,
        };
        let msg = format!("{err}");
        assert!(msg.contains("max_work_queues"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("2048"));
    }
}
