//! Per-queue throttle state shared between transfer threads.
//!
//! The [`ByteBucket`] lives behind a mutex. The two dispatch-blocking flags are
//! atomics so that the scheduler can evaluate [`Throttle::is_assignable`]
//! without taking any lock.
//!
//! # Memory ordering
//!
//! - `negative_bucket`: stored with `Release` while the bucket mutex is held,
//!   loaded with `Acquire`. A reader that sees `false` after a load also sees
//!   the balance that load produced.
//! - `throttle_wait`: same contract as `negative_bucket`.
//! - `transfer_thread_is_delaying`: advisory, `Relaxed`.
//!
//! Both blocking flags are only ever set while the rate is non-zero, and
//! `set_rate(0)` clears them under the bucket mutex, so a zero rate always
//! reads as fully unthrottled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bbxfer_core::{ExtentInfo, LvKey, TagId};
use tracing::debug;

use crate::token_bucket::ByteBucket;

/// Point-in-time view of throttle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleState {
    /// Rate in bytes per second.
    pub rate: u64,
    /// Token balance.
    pub bucket: i64,
    /// Explicit do-not-dispatch flag.
    pub throttle_wait: bool,
    /// Set while the balance is negative.
    pub negative_bucket: bool,
    /// A transfer thread is sleeping off a wait returned by `process_bucket`.
    pub transfer_thread_is_delaying: bool,
}

/// Token-bucket throttle for one work queue.
#[derive(Debug)]
pub struct Throttle {
    bucket: Mutex<ByteBucket>,
    throttle_wait: AtomicBool,
    negative_bucket: AtomicBool,
    transfer_thread_is_delaying: AtomicBool,
}

impl Throttle {
    /// Creates a disabled throttle.
    #[must_use]
    pub const fn new(burst_cap: Option<u64>, current_time_us: u64) -> Self {
        Self {
            bucket: Mutex::new(ByteBucket::new(burst_cap, current_time_us)),
            throttle_wait: AtomicBool::new(false),
            negative_bucket: AtomicBool::new(false),
            transfer_thread_is_delaying: AtomicBool::new(false),
        }
    }

    fn bucket(&self) -> MutexGuard<'_, ByteBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the rate in bytes per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.bucket().rate()
    }

    /// Returns the token balance.
    #[must_use]
    pub fn balance(&self) -> i64 {
        self.bucket().balance()
    }

    /// Sets the rate. A rate of 0 clears the balance and both blocking flags.
    pub fn set_rate(&self, lv_key: &LvKey, rate: u64, current_time_us: u64) {
        let mut bucket = self.bucket();
        let old_rate = bucket.rate();
        if bucket.set_rate(rate, current_time_us) {
            self.throttle_wait.store(false, Ordering::Release);
            self.negative_bucket.store(false, Ordering::Release);
        } else if bucket.balance() >= 0 {
            // Settling at the old rate may have paid off the debt.
            self.negative_bucket.store(false, Ordering::Release);
        }
        drop(bucket);
        debug!(lv_key = %lv_key, old_rate, rate, "Throttle rate set");
    }

    /// Loads tokens for elapsed time and clears the negative flag once the
    /// balance is out of debt.
    ///
    /// # Returns
    ///
    /// The number of tokens added.
    pub fn load_bucket(&self, lv_key: &LvKey, current_time_us: u64) -> u64 {
        let mut bucket = self.bucket();
        let added = bucket.load(current_time_us);
        if bucket.balance() >= 0 && self.negative_bucket.swap(false, Ordering::AcqRel) {
            debug!(lv_key = %lv_key, bucket = bucket.balance(), "Throttle bucket out of debt");
        }
        added
    }

    /// Charges an extent against the bucket.
    ///
    /// # Returns
    ///
    /// How long the caller should wait before dispatching again. Zero when
    /// the rate is 0 or the balance stays non-negative.
    pub fn process_bucket(&self, lv_key: &LvKey, tag: TagId, extent: &ExtentInfo) -> Duration {
        let mut bucket = self.bucket();
        let charge = bucket.charge(extent.length);
        if charge.in_debt() {
            self.negative_bucket.store(true, Ordering::Release);
            debug!(
                lv_key = %lv_key,
                tag = %tag,
                handle = %extent.handle,
                contrib_id = %extent.contrib_id,
                length = extent.length,
                bucket = charge.balance,
                wait_us = u64::try_from(charge.wait.as_micros()).unwrap_or(u64::MAX),
                "Throttle bucket in debt"
            );
        }
        charge.wait
    }

    /// Sets the explicit do-not-dispatch flag.
    ///
    /// Ignored while the rate is 0, which keeps a disabled throttle clean.
    ///
    /// # Returns
    ///
    /// The value the flag now holds.
    pub fn set_throttle_wait(&self, value: bool) -> bool {
        let bucket = self.bucket();
        let value = value && bucket.rate() != 0;
        self.throttle_wait.store(value, Ordering::Release);
        value
    }

    /// Returns the explicit do-not-dispatch flag.
    #[must_use]
    pub fn throttle_wait(&self) -> bool {
        self.throttle_wait.load(Ordering::Acquire)
    }

    /// Returns true if the last charge left the bucket in debt and no load has
    /// paid it off yet.
    #[must_use]
    pub fn has_negative_bucket(&self) -> bool {
        self.negative_bucket.load(Ordering::Acquire)
    }

    /// Returns false while the bucket is in debt or the wait flag is set.
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        !(self.has_negative_bucket() || self.throttle_wait())
    }

    /// Records whether a transfer thread is sleeping off a throttle wait.
    pub fn set_transfer_thread_is_delaying(&self, value: bool) {
        self.transfer_thread_is_delaying.store(value, Ordering::Relaxed);
    }

    /// Returns whether a transfer thread is sleeping off a throttle wait.
    #[must_use]
    pub fn transfer_thread_is_delaying(&self) -> bool {
        self.transfer_thread_is_delaying.load(Ordering::Relaxed)
    }

    /// Returns a consistent view of the throttle.
    #[must_use]
    pub fn state(&self) -> ThrottleState {
        let bucket = self.bucket();
        ThrottleState {
            rate: bucket.rate(),
            bucket: bucket.balance(),
            throttle_wait: self.throttle_wait(),
            negative_bucket: self.has_negative_bucket(),
            transfer_thread_is_delaying: self.transfer_thread_is_delaying(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bbxfer_core::{ContribId, TransferHandle};
    use uuid::Uuid;

    use super::*;

    fn key() -> LvKey {
        LvKey::new("/dev/bb/lv0", Uuid::new_v4()).unwrap()
    }

    fn extent(length: u64) -> ExtentInfo {
        ExtentInfo::new(TransferHandle::new(1), ContribId::new(0), length)
    }

    #[test]
    fn test_debt_then_recovery() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        throttle.set_rate(&key, 1_000, 0);
        throttle.load_bucket(&key, 500_000);
        assert_eq!(throttle.balance(), 500);

        let wait = throttle.process_bucket(&key, TagId::new(1), &extent(800));
        assert_eq!(throttle.balance(), -300);
        assert!(throttle.has_negative_bucket());
        assert!(!throttle.is_assignable());
        assert_eq!(wait, Duration::from_millis(300));

        throttle.load_bucket(&key, 1_500_000);
        assert_eq!(throttle.balance(), 700);
        assert!(!throttle.has_negative_bucket());
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_partial_load_keeps_flag() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        throttle.set_rate(&key, 1_000, 0);
        throttle.process_bucket(&key, TagId::new(1), &extent(2_000));

        throttle.load_bucket(&key, 1_000_000);
        assert_eq!(throttle.balance(), -1_000);
        assert!(throttle.has_negative_bucket());
    }

    #[test]
    fn test_rate_change_settles_debt_at_old_rate() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        throttle.set_rate(&key, 1_000, 0);
        throttle.process_bucket(&key, TagId::new(1), &extent(500));
        assert!(throttle.has_negative_bucket());

        // One second at the old rate pays the debt before the switch.
        throttle.set_rate(&key, 10, 1_000_000);
        assert_eq!(throttle.balance(), 500);
        assert!(!throttle.has_negative_bucket());
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_set_rate_zero_clears_everything() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        throttle.set_rate(&key, 1_000, 0);
        throttle.process_bucket(&key, TagId::new(1), &extent(5_000));
        assert!(throttle.set_throttle_wait(true));
        assert!(!throttle.is_assignable());

        throttle.set_rate(&key, 0, 1_000);
        let state = throttle.state();
        assert_eq!(state.rate, 0);
        assert_eq!(state.bucket, 0);
        assert!(!state.throttle_wait);
        assert!(!state.negative_bucket);
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_throttle_wait_ignored_when_disabled() {
        let throttle = Throttle::new(None, 0);
        assert!(!throttle.set_throttle_wait(true));
        assert!(!throttle.throttle_wait());
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_throttle_wait_blocks_with_positive_bucket() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        throttle.set_rate(&key, 1_000, 0);
        throttle.load_bucket(&key, 10_000_000);

        assert!(throttle.set_throttle_wait(true));
        assert!(!throttle.is_assignable());
        assert!(!throttle.set_throttle_wait(false));
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_zero_rate_process_is_noop() {
        let key = key();
        let throttle = Throttle::new(None, 0);
        let wait = throttle.process_bucket(&key, TagId::new(1), &extent(1 << 20));
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(throttle.balance(), 0);
        assert!(throttle.is_assignable());
    }

    #[test]
    fn test_delaying_flag() {
        let throttle = Throttle::new(None, 0);
        throttle.set_transfer_thread_is_delaying(true);
        assert!(throttle.transfer_thread_is_delaying());
        assert!(throttle.state().transfer_thread_is_delaying);
    }
}
