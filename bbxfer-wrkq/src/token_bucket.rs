//! Byte-rate token bucket.
//!
//! Tokens are bytes. The bucket is loaded periodically at the configured rate
//! and charged once per dispatched extent. Unlike a classic admission bucket the
//! balance is signed: a charge larger than the balance is always accepted and
//! leaves the bucket in debt, and the caller is told how long the debt takes to
//! pay off at the current rate.
//!
//! `ByteBucket` holds plain state with no synchronization. The owning
//! [`Throttle`](crate::throttle::Throttle) serializes access to it.

use std::time::Duration;

/// Outcome of charging an extent against the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    /// Balance after the charge.
    pub balance: i64,
    /// How long the caller should wait before dispatching from this queue again.
    pub wait: Duration,
}

impl Charge {
    /// Returns true if the charge left the bucket in debt.
    #[must_use]
    pub const fn in_debt(&self) -> bool {
        self.balance < 0
    }
}

/// A signed byte-rate token bucket.
#[derive(Debug, Clone)]
pub struct ByteBucket {
    /// Target rate in bytes per second; 0 disables throttling.
    rate: u64,

    /// Current balance in bytes. Negative values are debt.
    balance: i64,

    /// Optional ceiling on accumulated tokens. `None` means uncapped.
    burst_cap: Option<u64>,

    /// Last time tokens were loaded (microseconds).
    last_load_us: u64,

    /// Sub-byte credit carried between loads, in byte-microseconds per second
    /// (always below 1_000_000).
    remainder: u64,
}

impl ByteBucket {
    /// Creates a disabled bucket (rate 0, balance 0).
    ///
    /// # Arguments
    ///
    /// * `burst_cap` - Optional ceiling on the positive balance.
    /// * `current_time_us` - Current time in microseconds.
    #[must_use]
    pub const fn new(burst_cap: Option<u64>, current_time_us: u64) -> Self {
        Self {
            rate: 0,
            balance: 0,
            burst_cap,
            last_load_us: current_time_us,
            remainder: 0,
        }
    }

    /// Returns the configured rate in bytes per second.
    #[must_use]
    pub const fn rate(&self) -> u64 {
        self.rate
    }

    /// Returns the current balance.
    #[must_use]
    pub const fn balance(&self) -> i64 {
        self.balance
    }

    /// Returns the burst cap, if any.
    #[must_use]
    pub const fn burst_cap(&self) -> Option<u64> {
        self.burst_cap
    }

    /// Sets the rate.
    ///
    /// A rate of 0 zeroes the balance. Enabling a previously disabled bucket
    /// restarts the load clock so that time spent disabled earns no tokens.
    /// Switching between two non-zero rates first settles the elapsed time at
    /// the old rate.
    ///
    /// # Returns
    ///
    /// `true` if the bucket was reset because the rate is now 0.
    pub fn set_rate(&mut self, rate: u64, current_time_us: u64) -> bool {
        if rate == 0 {
            self.rate = 0;
            self.balance = 0;
            self.remainder = 0;
            self.last_load_us = current_time_us;
            return true;
        }
        if self.rate == 0 {
            self.remainder = 0;
            self.last_load_us = current_time_us;
        } else {
            self.load(current_time_us);
        }
        self.rate = rate;
        false
    }

    /// Loads tokens for the time elapsed since the last load.
    ///
    /// # Arguments
    ///
    /// * `current_time_us` - Current time in microseconds.
    ///
    /// # Returns
    ///
    /// The number of tokens added.
    pub fn load(&mut self, current_time_us: u64) -> u64 {
        if self.rate == 0 {
            self.last_load_us = current_time_us.max(self.last_load_us);
            return 0;
        }

        // Handle time going backwards (e.g., in simulation).
        if current_time_us <= self.last_load_us {
            return 0;
        }

        let elapsed_us = current_time_us - self.last_load_us;
        self.last_load_us = current_time_us;

        // Use u128 to avoid overflow for large elapsed times.
        let credit =
            u128::from(elapsed_us) * u128::from(self.rate) + u128::from(self.remainder);
        // Always below 1_000_000, so the conversion cannot fail.
        self.remainder = u64::try_from(credit % 1_000_000).unwrap_or(0);
        let tokens_to_add = u64::try_from(credit / 1_000_000).unwrap_or(u64::MAX);
        if tokens_to_add == 0 {
            return 0;
        }

        let old_balance = self.balance;
        let added = i64::try_from(tokens_to_add).unwrap_or(i64::MAX);
        let mut balance = self.balance.saturating_add(added);
        if let Some(cap) = self.burst_cap {
            let cap = i64::try_from(cap).unwrap_or(i64::MAX);
            // Never pull an already larger balance down to the cap.
            if balance > cap {
                balance = cap.max(old_balance);
            }
        }
        self.balance = balance;

        (self.balance - old_balance).unsigned_abs()
    }

    /// Charges `length` bytes against the bucket.
    ///
    /// With a rate of 0 this is a no-op that returns a zero wait.
    pub fn charge(&mut self, length: u64) -> Charge {
        if self.rate == 0 {
            return Charge {
                balance: self.balance,
                wait: Duration::ZERO,
            };
        }

        let length = i64::try_from(length).unwrap_or(i64::MAX);
        self.balance = self.balance.saturating_sub(length);

        Charge {
            balance: self.balance,
            wait: self.debt_wait(),
        }
    }

    /// Returns how long the current debt takes to pay off at the current rate.
    #[must_use]
    pub fn debt_wait(&self) -> Duration {
        if self.balance >= 0 || self.rate == 0 {
            return Duration::ZERO;
        }
        let deficit = self.balance.unsigned_abs();
        // Time = (deficit * 1_000_000) / rate.
        let wait_us = u64::try_from(u128::from(deficit) * 1_000_000 / u128::from(self.rate))
            .unwrap_or(u64::MAX);
        Duration::from_micros(wait_us)
    }
}
