//! bbxfer Core - Strongly-typed identifiers and limits for burst-buffer transfers.
//!
//! This crate provides the values shared by the request path, the per-volume
//! work queues and the transfer threads. It holds no locks and does no I/O.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `JobId` with a `TransferHandle`
//! - **Validated keys**: An `LvKey` cannot be built from an empty path or nil UUID
//! - **Explicit limits**: Registry size and throttle rates have bounded maxima
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod types;
mod work;

pub use error::{Error, Result};
pub use limits::Limits;
pub use types::{ContribId, JobId, LvInfoHandle, TagId, TransferHandle};
pub use work::{ExtentInfo, LvKey, WorkId};
