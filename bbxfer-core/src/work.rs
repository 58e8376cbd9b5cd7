//! Logical-volume keys, work items and extent descriptions.
//!
//! These are the values that flow between the request path, the per-volume
//! work queues and the transfer threads.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ContribId, JobId, TransferHandle};

/// Key of a logical volume under active data movement.
///
/// A volume path alone is not unique across mounts, so the key pairs it with a
/// UUID minted when the volume was registered.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LvKey {
    path: String,
    uuid: Uuid,
}

impl LvKey {
    /// Creates a volume key.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the path is empty or the UUID is nil.
    pub fn new(path: impl Into<String>, uuid: Uuid) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::InvalidArgument {
                name: "lv_key.path",
                reason: "must not be empty",
            });
        }
        if uuid.is_nil() {
            return Err(Error::InvalidArgument {
                name: "lv_key.uuid",
                reason: "must not be nil",
            });
        }
        Ok(Self { path, uuid })
    }

    /// Returns the volume path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the uniqueness token.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Debug for LvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LvKey({}, {})", self.path, self.uuid)
    }
}

impl fmt::Display for LvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.uuid)
    }
}

/// One queued extent transfer.
///
/// `seq` is allocated by the owning queue and is unique within it; the other
/// fields say which transfer the extent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId {
    /// Job that owns the transfer.
    pub job_id: JobId,
    /// Transfer definition handle.
    pub handle: TransferHandle,
    /// Contributing compute node.
    pub contrib_id: ContribId,
    /// Queue-scoped sequence number.
    pub seq: u64,
}

impl WorkId {
    /// Creates a work item identifier.
    #[must_use]
    pub const fn new(job_id: JobId, handle: TransferHandle, contrib_id: ContribId, seq: u64) -> Self {
        Self {
            job_id,
            handle,
            contrib_id,
            seq,
        }
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "work({}/{}/{}#{})",
            self.job_id, self.handle, self.contrib_id, self.seq
        )
    }
}

/// Extent metadata handed to throttle accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInfo {
    /// Transfer the extent belongs to.
    pub handle: TransferHandle,
    /// Contributing compute node.
    pub contrib_id: ContribId,
    /// Index of the source file within the transfer definition.
    pub source_index: u32,
    /// Extent length in bytes.
    pub length: u64,
}

impl ExtentInfo {
    /// Creates extent metadata for the first source file of a transfer.
    #[must_use]
    pub const fn new(handle: TransferHandle, contrib_id: ContribId, length: u64) -> Self {
        Self {
            handle,
            contrib_id,
            source_index: 0,
            length,
        }
    }

    /// Sets the source file index.
    #[must_use]
    pub const fn with_source_index(mut self, source_index: u32) -> Self {
        self.source_index = source_index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lv_key_requires_path() {
        let err = LvKey::new("", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "lv_key.path", .. }));
    }

    #[test]
    fn test_lv_key_requires_uuid() {
        let err = LvKey::new("/dev/bb/lv0", Uuid::nil()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "lv_key.uuid", .. }));
    }

    #[test]
    fn test_lv_key_identity() {
        let uuid = Uuid::new_v4();
        let a = LvKey::new("/dev/bb/lv0", uuid).unwrap();
        let b = LvKey::new("/dev/bb/lv0", uuid).unwrap();
        let c = LvKey::new("/dev/bb/lv0", Uuid::new_v4()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.path(), "/dev/bb/lv0");
        assert_eq!(format!("{a}"), format!("/dev/bb/lv0:{uuid}"));
    }

    #[test]
    fn test_work_id_display() {
        let id = WorkId::new(JobId::new(3), TransferHandle::new(4), ContribId::new(5), 6);
        assert_eq!(format!("{id}"), "work(job-3/xfer-4/contrib-5#6)");
    }

    #[test]
    fn test_extent_info_builder() {
        let extent = ExtentInfo::new(TransferHandle::new(1), ContribId::new(0), 4096)
            .with_source_index(2);
        assert_eq!(extent.length, 4096);
        assert_eq!(extent.source_index, 2);
    }
}
