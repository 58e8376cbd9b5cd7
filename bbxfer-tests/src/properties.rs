//! Property definitions and checkers for work queue tests.
//!
//! Properties are invariants that must hold after any interleaving of
//! producers, transfer threads and bucket loads. Producers and consumers
//! record into a [`FifoChecker`] while they hold the queue lock, so the
//! recorded orders are the orders the queue actually saw.

use std::collections::{BTreeMap, HashMap};

use bbxfer_core::WorkId;
use bbxfer_wrkq::QueueSnapshot;

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a work queue property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// An item was pushed but neither popped nor left in the queue.
    Lost {
        /// The missing item.
        work_id: WorkId,
    },
    /// An item came out more often than it went in.
    Duplicated {
        /// The duplicated item.
        work_id: WorkId,
        /// How often it came out.
        count: usize,
    },
    /// An item came out that was never pushed.
    Fabricated {
        /// The unknown item.
        work_id: WorkId,
    },
    /// The n-th pop did not return the n-th push.
    OutOfOrder {
        /// Position in the pop sequence.
        position: usize,
        /// Item pushed at that position.
        expected: WorkId,
        /// Item actually popped.
        actual: WorkId,
    },
    /// `enqueued - processed` disagrees with the remaining length.
    CounterMismatch {
        /// Total items queued.
        enqueued: u64,
        /// Total items popped.
        processed: u64,
        /// Items still queued.
        remaining: usize,
    },
    /// The negative-bucket flag disagrees with the balance.
    NegativeFlagMismatch {
        /// Token balance.
        bucket: i64,
        /// Flag value.
        negative_bucket: bool,
    },
    /// A blocking flag is set while throttling is disabled.
    FlagOnDisabledThrottle {
        /// Volume key.
        lv_key: String,
    },
    /// More bytes were dispatched than the rate had earned.
    RateExceeded {
        /// Volume key.
        lv_key: String,
        /// Bytes dispatched before this dispatch.
        dispatched: u64,
        /// Bytes earned since throttling was enabled.
        earned: u64,
    },
    /// An item was dispatched from a suspended queue.
    DispatchWhileSuspended {
        /// Volume key.
        lv_key: String,
        /// The dispatched item.
        work_id: WorkId,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lost { work_id } => write!(f, "{work_id} was lost"),
            Self::Duplicated { work_id, count } => {
                write!(f, "{work_id} was delivered {count} times")
            }
            Self::Fabricated { work_id } => write!(f, "{work_id} was never queued"),
            Self::OutOfOrder {
                position,
                expected,
                actual,
            } => write!(
                f,
                "pop #{position} returned {actual}, expected {expected}"
            ),
            Self::CounterMismatch {
                enqueued,
                processed,
                remaining,
            } => write!(
                f,
                "counters disagree: enqueued={enqueued} processed={processed} remaining={remaining}"
            ),
            Self::NegativeFlagMismatch {
                bucket,
                negative_bucket,
            } => write!(f, "bucket={bucket} but negative_bucket={negative_bucket}"),
            Self::FlagOnDisabledThrottle { lv_key } => {
                write!(f, "{lv_key}: blocking flag set with rate 0")
            }
            Self::RateExceeded {
                lv_key,
                dispatched,
                earned,
            } => write!(
                f,
                "{lv_key}: dispatched {dispatched} bytes with only {earned} earned"
            ),
            Self::DispatchWhileSuspended { lv_key, work_id } => {
                write!(f, "{lv_key}: dispatched {work_id} while suspended")
            }
        }
    }
}

// ============================================================================
// FIFO Checker
// ============================================================================

/// Records the push and pop order of one queue.
#[derive(Debug, Default)]
pub struct FifoChecker {
    pushed: Vec<WorkId>,
    popped: Vec<WorkId>,
}

impl FifoChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful push. Call while holding the queue lock.
    pub fn record_push(&mut self, work_id: WorkId) {
        self.pushed.push(work_id);
    }

    /// Records a successful pop. Call while holding the queue lock.
    pub fn record_pop(&mut self, work_id: WorkId) {
        self.popped.push(work_id);
    }

    /// Returns the number of recorded pushes.
    #[must_use]
    pub fn pushes(&self) -> usize {
        self.pushed.len()
    }

    /// Returns the number of recorded pops.
    #[must_use]
    pub fn pops(&self) -> usize {
        self.popped.len()
    }

    /// Returns the recorded pop order.
    #[must_use]
    pub fn popped(&self) -> &[WorkId] {
        &self.popped
    }

    /// Checks all FIFO properties against the final queue contents.
    ///
    /// `remaining` is the queue's content front first.
    #[must_use]
    pub fn check_all(
        &self,
        remaining: &[WorkId],
        enqueued: u64,
        processed: u64,
    ) -> Vec<PropertyViolation> {
        let mut violations = Vec::new();
        violations.extend(self.check_no_loss_no_dup(remaining));
        violations.extend(self.check_order(remaining));
        violations.extend(check_counters(enqueued, processed, remaining.len()));
        violations
    }

    /// Pushed items equal popped plus remaining, as multisets.
    #[must_use]
    pub fn check_no_loss_no_dup(&self, remaining: &[WorkId]) -> Vec<PropertyViolation> {
        let mut pushed: HashMap<WorkId, usize> = HashMap::new();
        for id in &self.pushed {
            *pushed.entry(*id).or_default() += 1;
        }
        let mut delivered: HashMap<WorkId, usize> = HashMap::new();
        for id in self.popped.iter().chain(remaining) {
            *delivered.entry(*id).or_default() += 1;
        }

        let mut violations = Vec::new();
        for (id, &count) in &delivered {
            match pushed.get(id) {
                None => violations.push(PropertyViolation::Fabricated { work_id: *id }),
                Some(&expected) if count > expected => {
                    violations.push(PropertyViolation::Duplicated { work_id: *id, count });
                }
                Some(_) => {}
            }
        }
        for (id, &expected) in &pushed {
            if delivered.get(id).copied().unwrap_or(0) < expected {
                violations.push(PropertyViolation::Lost { work_id: *id });
            }
        }
        violations
    }

    /// Pops followed by the remaining items reproduce the push order exactly.
    #[must_use]
    pub fn check_order(&self, remaining: &[WorkId]) -> Vec<PropertyViolation> {
        self.pushed
            .iter()
            .zip(self.popped.iter().chain(remaining))
            .enumerate()
            .find(|(_, (expected, actual))| expected != actual)
            .map(|(position, (expected, actual))| PropertyViolation::OutOfOrder {
                position,
                expected: *expected,
                actual: *actual,
            })
            .into_iter()
            .collect()
    }
}

/// Checks that the counters account for every queued item.
#[must_use]
pub fn check_counters(enqueued: u64, processed: u64, remaining: usize) -> Vec<PropertyViolation> {
    if processed > enqueued || enqueued - processed != remaining as u64 {
        vec![PropertyViolation::CounterMismatch {
            enqueued,
            processed,
            remaining,
        }]
    } else {
        Vec::new()
    }
}

/// Checks the throttle flags of a snapshot against its balance and rate.
#[must_use]
pub fn check_throttle_state(snapshot: &QueueSnapshot) -> Vec<PropertyViolation> {
    let mut violations = Vec::new();
    if snapshot.negative_bucket != (snapshot.bucket < 0) {
        violations.push(PropertyViolation::NegativeFlagMismatch {
            bucket: snapshot.bucket,
            negative_bucket: snapshot.negative_bucket,
        });
    }
    if snapshot.rate == 0 && (snapshot.negative_bucket || snapshot.throttle_wait) {
        violations.push(PropertyViolation::FlagOnDisabledThrottle {
            lv_key: snapshot.lv_key.clone(),
        });
    }
    violations
}

/// Checks that a dispatch stays within the bytes a rate has earned.
///
/// A queue only dispatches while its balance is non-negative, so everything
/// charged before a dispatch must have been loaded, and loads never exceed
/// `rate * elapsed`.
#[must_use]
pub fn check_rate_bound(
    lv_key: &str,
    rate: u64,
    elapsed_us: u64,
    dispatched: u64,
) -> Option<PropertyViolation> {
    if rate == 0 {
        return None;
    }
    let earned = u64::try_from(u128::from(rate) * u128::from(elapsed_us) / 1_000_000)
        .unwrap_or(u64::MAX);
    (dispatched > earned).then(|| PropertyViolation::RateExceeded {
        lv_key: lv_key.to_string(),
        dispatched,
        earned,
    })
}

/// Checks that items from each producer were popped in the order that
/// producer pushed them. `producer` maps an item to its producer.
#[must_use]
pub fn check_per_producer_order<K: Ord + Copy>(
    popped: &[WorkId],
    producer: impl Fn(&WorkId) -> K,
) -> Vec<PropertyViolation> {
    let mut last: BTreeMap<K, WorkId> = BTreeMap::new();
    let mut violations = Vec::new();
    for (position, id) in popped.iter().enumerate() {
        if let Some(prev) = last.insert(producer(id), *id) {
            if prev.seq > id.seq {
                violations.push(PropertyViolation::OutOfOrder {
                    position,
                    expected: prev,
                    actual: *id,
                });
            }
        }
    }
    violations
}
