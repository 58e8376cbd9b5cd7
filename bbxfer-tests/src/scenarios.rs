//! Reusable test scenarios for work queue simulation.
//!
//! [`DispatchSimulation`] drives a [`WorkQueueManager`] on a single thread
//! with simulated time: producers trickle extents into volumes, a tick loads
//! the buckets, and virtual transfer threads pick dispatchable queues and stay
//! busy for the throttle wait plus the transfer time. Every dispatch is
//! checked against the properties in [`crate::properties`].

use std::collections::HashMap;

use bbxfer_core::{ContribId, ExtentInfo, JobId, LvInfoHandle, LvKey, TagId, TransferHandle, WorkId};
use bbxfer_wrkq::{WorkQueueError, WorkQueueManager, WorkQueueManagerConfig};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use crate::properties::{check_rate_bound, check_throttle_state, FifoChecker, PropertyViolation};

/// Installs a test-writer fmt subscriber. Safe to call from every test.
pub fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard seeds run by every scenario test.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];

    /// Number of random seeds to test in CI.
    pub const CI_SEED_COUNT: u32 = 32;
}

// ============================================================================
// Configuration
// ============================================================================

/// One simulated volume.
#[derive(Debug, Clone)]
pub struct VolumeProfile {
    /// Volume path.
    pub path: &'static str,
    /// Owning job.
    pub job_id: JobId,
    /// Throttle rate in bytes per second; 0 disables throttling.
    pub rate: u64,
    /// Number of extents the producers queue.
    pub extents: usize,
}

impl VolumeProfile {
    /// Creates a volume profile.
    #[must_use]
    pub const fn new(path: &'static str, job_id: u64, rate: u64, extents: usize) -> Self {
        Self {
            path,
            job_id: JobId::new(job_id),
            rate,
            extents,
        }
    }
}

/// Suspends one volume for a window of simulated time.
#[derive(Debug, Clone, Copy)]
pub struct SuspendWindow {
    /// Index into `SimulationConfig::volumes`.
    pub volume: usize,
    /// Start of the window in microseconds.
    pub from_us: u64,
    /// End of the window in microseconds.
    pub until_us: u64,
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// RNG seed.
    pub seed: u64,
    /// Volumes to register.
    pub volumes: Vec<VolumeProfile>,
    /// Number of virtual transfer threads.
    pub workers: usize,
    /// Simulation step in microseconds.
    pub step_us: u64,
    /// Bucket load interval in microseconds.
    pub tick_us: u64,
    /// Smallest extent in bytes.
    pub min_extent: u64,
    /// Largest extent in bytes.
    pub max_extent: u64,
    /// Per-thread transfer speed in bytes per second.
    pub transfer_bytes_per_sec: u64,
    /// Chance per step that a producer queues an extent.
    pub produce_probability: f64,
    /// Give up after this much simulated time.
    pub max_time_us: u64,
    /// Optional suspend window.
    pub suspend: Option<SuspendWindow>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            volumes: vec![
                VolumeProfile::new("/dev/bb/fast", 1, 4 << 20, 40),
                VolumeProfile::new("/dev/bb/slow", 1, 256 << 10, 20),
                VolumeProfile::new("/dev/bb/open", 2, 0, 40),
            ],
            workers: 4,
            step_us: 1_000,
            tick_us: 10_000,
            min_extent: 4 << 10,
            max_extent: 64 << 10,
            transfer_bytes_per_sec: 64 << 20,
            produce_probability: 0.5,
            max_time_us: 60_000_000,
            suspend: None,
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Per-volume outcome.
#[derive(Debug)]
pub struct VolumeReport {
    /// Volume key.
    pub lv_key: LvKey,
    /// Throttle rate.
    pub rate: u64,
    /// Items dispatched.
    pub dispatched: usize,
    /// Bytes dispatched.
    pub bytes: u64,
    /// Time of the last dispatch.
    pub last_dispatch_us: u64,
    /// Push/pop history.
    pub checker: FifoChecker,
}

/// Outcome of a simulation run.
#[derive(Debug)]
pub struct SimulationReport {
    /// Per-volume outcomes, in `SimulationConfig::volumes` order.
    pub volumes: Vec<VolumeReport>,
    /// Simulated time when the run stopped.
    pub end_time_us: u64,
    /// True if every extent was produced and dispatched.
    pub completed: bool,
    /// Violations found during the run.
    pub violations: Vec<PropertyViolation>,
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Busy {
    volume: usize,
    work_id: WorkId,
    until_us: u64,
}

/// Single-threaded dispatcher simulation over a [`WorkQueueManager`].
#[derive(Debug)]
pub struct DispatchSimulation {
    config: SimulationConfig,
    manager: WorkQueueManager,
    keys: Vec<LvKey>,
    rng: ChaCha8Rng,
    now_us: u64,
    produced: Vec<usize>,
    lengths: HashMap<WorkId, u64>,
    workers: Vec<Option<Busy>>,
    reports: Vec<VolumeReport>,
    violations: Vec<PropertyViolation>,
}

impl DispatchSimulation {
    /// Registers the configured volumes and sets their rates.
    ///
    /// # Errors
    ///
    /// Returns an error if a volume cannot be registered.
    pub fn new(config: SimulationConfig) -> Result<Self, WorkQueueError> {
        let manager = WorkQueueManager::new(WorkQueueManagerConfig::for_testing())?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        let mut keys = Vec::with_capacity(config.volumes.len());
        let mut reports = Vec::with_capacity(config.volumes.len());
        for (index, profile) in config.volumes.iter().enumerate() {
            let lv_key = LvKey::new(profile.path, Uuid::from_u128(rng.gen::<u128>() | 1))?;
            manager.add_work_queue(
                lv_key.clone(),
                LvInfoHandle::new(index as u64),
                profile.job_id,
                false,
                0,
            )?;
            manager.set_throttle_rate(&lv_key, profile.rate, 0)?;
            reports.push(VolumeReport {
                lv_key: lv_key.clone(),
                rate: profile.rate,
                dispatched: 0,
                bytes: 0,
                last_dispatch_us: 0,
                checker: FifoChecker::new(),
            });
            keys.push(lv_key);
        }

        Ok(Self {
            produced: vec![0; config.volumes.len()],
            workers: vec![None; config.workers],
            config,
            manager,
            keys,
            rng,
            now_us: 0,
            lengths: HashMap::new(),
            reports,
            violations: Vec::new(),
        })
    }

    /// Returns the manager under simulation.
    #[must_use]
    pub const fn manager(&self) -> &WorkQueueManager {
        &self.manager
    }

    /// Runs until every extent is dispatched or time runs out.
    ///
    /// # Errors
    ///
    /// Returns the first unexpected queue error.
    pub fn run(mut self) -> Result<SimulationReport, WorkQueueError> {
        while self.now_us < self.config.max_time_us {
            self.apply_suspend_window();
            self.finish_transfers();
            if self.now_us % self.config.tick_us == 0 {
                self.manager.load_buckets(self.now_us)?;
            }
            self.produce()?;
            self.dispatch()?;
            self.check_snapshots();

            if self.is_done() {
                break;
            }
            self.now_us += self.config.step_us;
        }

        let completed = self.is_done();
        for (volume, key) in self.keys.iter().enumerate() {
            if let Some(queue) = self.manager.get(key) {
                let remaining = queue.snapshot();
                let items = queue.work_items();
                self.violations.extend(self.reports[volume].checker.check_all(
                    &items,
                    remaining.number_of_work_items,
                    remaining.number_of_work_items_processed,
                ));
            }
        }

        Ok(SimulationReport {
            volumes: self.reports,
            end_time_us: self.now_us,
            completed,
            violations: self.violations,
        })
    }

    fn is_done(&self) -> bool {
        self.workers.iter().all(Option::is_none)
            && self
                .config
                .volumes
                .iter()
                .zip(&self.reports)
                .all(|(profile, report)| report.dispatched == profile.extents)
    }

    fn apply_suspend_window(&self) {
        if let Some(window) = self.config.suspend {
            let suspended = (window.from_us..window.until_us).contains(&self.now_us);
            if let Some(queue) = self.manager.get(&self.keys[window.volume]) {
                queue.set_suspended(suspended);
            }
        }
    }

    fn finish_transfers(&mut self) {
        for slot in &mut self.workers {
            if let Some(busy) = *slot {
                if busy.until_us <= self.now_us {
                    if let Some(queue) = self.manager.get(&self.keys[busy.volume]) {
                        queue.set_transfer_thread_is_delaying(false);
                        let issued = queue.set_issuing_work_item(None);
                        debug_assert_eq!(issued, Some(busy.work_id));
                    }
                    *slot = None;
                }
            }
        }
    }

    fn produce(&mut self) -> Result<(), WorkQueueError> {
        for volume in 0..self.keys.len() {
            if self.produced[volume] >= self.config.volumes[volume].extents
                || !self.rng.gen_bool(self.config.produce_probability)
            {
                continue;
            }
            let contrib = ContribId::new(self.rng.gen_range(0..4));
            let handle = TransferHandle::new(self.rng.gen_range(1..=3));
            let length = self.rng.gen_range(self.config.min_extent..=self.config.max_extent);

            let work_id = self.manager.add_work_item(&self.keys[volume], handle, contrib)?;
            self.reports[volume].checker.record_push(work_id);
            self.lengths.insert(work_id, length);
            self.produced[volume] += 1;
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), WorkQueueError> {
        let mut order: Vec<usize> = (0..self.keys.len()).collect();
        for worker in 0..self.workers.len() {
            if self.workers[worker].is_some() {
                continue;
            }
            order.shuffle(&mut self.rng);
            for &volume in &order {
                if let Some(busy) = self.try_dispatch(volume)? {
                    self.workers[worker] = Some(busy);
                    break;
                }
            }
        }
        Ok(())
    }

    fn try_dispatch(&mut self, volume: usize) -> Result<Option<Busy>, WorkQueueError> {
        let Some(queue) = self.manager.get(&self.keys[volume]) else {
            return Ok(None);
        };
        let Some(guard) = queue.try_lock_guard("dispatch") else {
            return Ok(None);
        };
        if !guard.is_dispatchable() || guard.issuing_work_item().is_some() {
            return Ok(None);
        }

        let report = &mut self.reports[volume];
        if let Some(violation) =
            check_rate_bound(&report.lv_key.to_string(), report.rate, self.now_us, report.bytes)
        {
            self.violations.push(violation);
        }

        let work_id = guard.remove_work_item(true)?;
        report.checker.record_pop(work_id);
        if guard.is_suspended() {
            self.violations.push(PropertyViolation::DispatchWhileSuspended {
                lv_key: report.lv_key.to_string(),
                work_id,
            });
        }
        let length = self.lengths.get(&work_id).copied().unwrap_or(self.config.min_extent);
        let extent = ExtentInfo::new(work_id.handle, work_id.contrib_id, length);
        let wait = guard.process_bucket(TagId::new(work_id.seq), &extent)?;
        guard.set_issuing_work_item(Some(work_id));
        if !wait.is_zero() {
            guard.set_transfer_thread_is_delaying(true);
        }

        report.dispatched += 1;
        report.bytes += length;
        report.last_dispatch_us = self.now_us;

        let wait_us = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        let transfer_us = length * 1_000_000 / self.config.transfer_bytes_per_sec.max(1);
        Ok(Some(Busy {
            volume,
            work_id,
            until_us: self.now_us + wait_us + transfer_us.max(1),
        }))
    }

    fn check_snapshots(&mut self) {
        for queue in self.manager.queues() {
            self.violations.extend(check_throttle_state(&queue.snapshot()));
        }
    }
}

/// Runs the default scenario with `seed`.
///
/// # Errors
///
/// Returns the first unexpected queue error.
pub fn run_default(seed: u64) -> Result<SimulationReport, WorkQueueError> {
    DispatchSimulation::new(SimulationConfig {
        seed,
        ..SimulationConfig::default()
    })?
    .run()
}
