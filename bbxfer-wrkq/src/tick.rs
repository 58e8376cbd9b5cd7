//! Background task that periodically loads every queue's throttle bucket.
//!
//! Timestamps handed to the work queues are microseconds on a
//! [`MonotonicClock`]. Queues must be created and loaded against the same
//! clock, so the clock is `Copy` and is shared with the request path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::manager::WorkQueueManager;

/// Microsecond clock anchored at a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Returns microseconds since the origin.
    #[must_use]
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads every registered bucket once per `interval` until shutdown.
///
/// Queue locks are blocking, so each pass runs on the blocking pool.
pub async fn replenish_task(
    manager: Arc<WorkQueueManager>,
    interval: Duration,
    clock: MonotonicClock,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut tick_interval = tokio::time::interval(interval);
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Replenish task shutting down");
                break;
            }
            _ = tick_interval.tick() => {
                let mgr = Arc::clone(&manager);
                let now = clock.now_us();
                match tokio::task::spawn_blocking(move || mgr.load_buckets(now)).await {
                    Ok(Ok(loaded)) => trace!(loaded, now_us = now, "Loaded throttle buckets"),
                    Ok(Err(e)) => error!(error = %e, "Failed to load throttle buckets"),
                    Err(e) => error!(error = %e, "Replenish pass panicked"),
                }
            }
        }
    }
}
