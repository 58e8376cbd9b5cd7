//! Manager, replenish task and transfer threads running together in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bbxfer_core::{ContribId, ExtentInfo, JobId, LvInfoHandle, LvKey, TagId, TransferHandle};
use bbxfer_wrkq::{
    replenish_task, MonotonicClock, WorkQueueError, WorkQueueManager, WorkQueueManagerConfig,
};
use tokio::sync::mpsc;
use tracing::Level;
use uuid::Uuid;

use crate::scenarios::init_tracing;

/// One transfer thread: poll for a dispatchable queue, pop, charge, sleep off
/// the wait, then clear the issuing marker.
fn transfer_thread(
    manager: &WorkQueueManager,
    extent_len: u64,
    target: u64,
    transferred: &AtomicU64,
    deadline: Instant,
) {
    while transferred.load(Ordering::Acquire) < target && Instant::now() < deadline {
        let mut dispatched = None;
        for queue in manager.queues() {
            let Some(guard) = queue.try_lock_guard("transfer") else {
                continue;
            };
            if !guard.is_dispatchable() || guard.issuing_work_item().is_some() {
                continue;
            }
            let item = guard.remove_work_item(true).unwrap();
            let extent = ExtentInfo::new(item.handle, item.contrib_id, extent_len);
            let wait = guard.process_bucket(TagId::new(item.seq), &extent).unwrap();
            guard.set_issuing_work_item(Some(item));
            guard.set_transfer_thread_is_delaying(!wait.is_zero());
            drop(guard);
            dispatched = Some((Arc::clone(&queue), wait));
            break;
        }

        match dispatched {
            Some((queue, wait)) => {
                thread::sleep(wait);
                queue.set_transfer_thread_is_delaying(false);
                queue.set_issuing_work_item(None);
                transferred.fetch_add(1, Ordering::AcqRel);
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_throttled_volume_respects_rate_in_real_time() {
    init_tracing();
    let clock = MonotonicClock::new();
    let manager = Arc::new(WorkQueueManager::new(WorkQueueManagerConfig::for_testing()).unwrap());
    let lv = LvKey::new("/dev/bb/throttled", Uuid::new_v4()).unwrap();
    manager
        .add_work_queue(lv.clone(), LvInfoHandle::new(1), JobId::new(1), false, clock.now_us())
        .unwrap();
    // 100 KB/s, five 10 KB extents.
    manager.set_throttle_rate(&lv, 100_000, clock.now_us()).unwrap();
    for contrib in 0..5 {
        manager
            .add_work_item(&lv, TransferHandle::new(1), ContribId::new(contrib))
            .unwrap();
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let ticker = tokio::spawn(replenish_task(
        Arc::clone(&manager),
        Duration::from_millis(5),
        clock,
        shutdown_rx,
    ));

    let start = Instant::now();
    let transferred = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let transferred = Arc::clone(&transferred);
            thread::spawn(move || {
                transfer_thread(
                    &manager,
                    10_000,
                    5,
                    &transferred,
                    Instant::now() + Duration::from_secs(10),
                );
            })
        })
        .collect();
    for worker in workers {
        tokio::task::spawn_blocking(move || worker.join().unwrap())
            .await
            .unwrap();
    }
    let elapsed = start.elapsed();

    shutdown_tx.send(()).await.unwrap();
    ticker.await.unwrap();

    assert_eq!(transferred.load(Ordering::Acquire), 5);
    // The fifth extent needs 40 KB already earned: at least 400ms.
    assert!(elapsed >= Duration::from_millis(350), "finished in {elapsed:?}");

    let queue = manager.get(&lv).unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.number_of_work_items_processed(), 5);
    assert!(queue.issuing_work_item().is_none());
    drop(queue);

    let report = manager.remove_work_queue(&lv).unwrap();
    assert!(report.discarded.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_change_to_zero_releases_backlog() {
    init_tracing();
    let clock = MonotonicClock::new();
    let manager = Arc::new(WorkQueueManager::new(WorkQueueManagerConfig::for_testing()).unwrap());
    let lv = LvKey::new("/dev/bb/backlog", Uuid::new_v4()).unwrap();
    manager
        .add_work_queue(lv.clone(), LvInfoHandle::new(1), JobId::new(1), false, clock.now_us())
        .unwrap();
    // 1 B/s: the first charge puts the bucket deep in debt.
    manager.set_throttle_rate(&lv, 1, clock.now_us()).unwrap();
    for contrib in 0..3 {
        manager
            .add_work_item(&lv, TransferHandle::new(1), ContribId::new(contrib))
            .unwrap();
    }
    {
        let queue = manager.get(&lv).unwrap();
        let guard = queue.lock_guard("test").unwrap();
        let item = guard.remove_work_item(true).unwrap();
        let wait = guard
            .process_bucket(TagId::new(1), &ExtentInfo::new(item.handle, item.contrib_id, 4096))
            .unwrap();
        assert!(wait > Duration::from_secs(3_600));
        assert!(!guard.is_assignable());
    }

    manager.set_throttle_rate(&lv, 0, clock.now_us()).unwrap();
    let queue = manager.get(&lv).unwrap();
    assert!(queue.is_assignable());
    assert!(queue.is_dispatchable());
    assert_eq!(queue.bucket(), 0);

    let guard = queue.lock_guard("drain").unwrap();
    let extent = ExtentInfo::new(TransferHandle::new(1), ContribId::new(0), 1 << 30);
    guard.remove_work_item(true).unwrap();
    assert_eq!(guard.process_bucket(TagId::new(2), &extent).unwrap(), Duration::ZERO);
    guard.remove_work_item(true).unwrap();
    assert!(guard.is_empty());
}

#[test]
fn test_suspend_job_then_resume() {
    init_tracing();
    let manager = WorkQueueManager::new(WorkQueueManagerConfig::for_testing()).unwrap();
    let keys: Vec<LvKey> = (0..3)
        .map(|n| LvKey::new(format!("/dev/bb/job7-{n}"), Uuid::new_v4()).unwrap())
        .collect();
    for (n, key) in keys.iter().enumerate() {
        manager
            .add_work_queue(key.clone(), LvInfoHandle::new(n as u64), JobId::new(7), false, 0)
            .unwrap();
        manager
            .add_work_item(key, TransferHandle::new(1), ContribId::new(0))
            .unwrap();
    }

    assert_eq!(manager.set_job_suspended(JobId::new(7), true), 3);
    for queue in manager.queues() {
        assert!(!queue.is_dispatchable());
        // New work is still accepted while suspended.
        manager
            .add_work_item(queue.lv_key(), TransferHandle::new(2), ContribId::new(1))
            .unwrap();
        assert_eq!(queue.wrkq_size(), 2);
    }

    assert_eq!(manager.set_job_suspended(JobId::new(7), false), 3);
    assert!(manager.queues().iter().all(|q| q.is_dispatchable()));
    assert_eq!(manager.set_job_suspended(JobId::new(8), true), 0);
}

#[test]
fn test_remove_volume_mid_transfer_is_refused() {
    init_tracing();
    let mut config = WorkQueueManagerConfig::for_testing();
    config.queue.dump_on_remove_work_item = true;
    let manager = WorkQueueManager::new(config).unwrap();
    let lv = LvKey::new("/dev/bb/busy", Uuid::new_v4()).unwrap();
    manager
        .add_work_queue(lv.clone(), LvInfoHandle::new(1), JobId::new(1), false, 0)
        .unwrap();
    for contrib in 0..4 {
        manager
            .add_work_item(&lv, TransferHandle::new(1), ContribId::new(contrib))
            .unwrap();
    }

    let issued = {
        let queue = manager.get(&lv).unwrap();
        let guard = queue.lock_guard("transfer").unwrap();
        let item = guard.remove_work_item(true).unwrap();
        guard.set_issuing_work_item(Some(item));
        item
    };

    let err = manager.remove_work_queue(&lv).unwrap_err();
    assert!(matches!(err, WorkQueueError::WorkItemInFlight { .. }));

    manager.get(&lv).unwrap().set_issuing_work_item(None);
    let report = manager.remove_work_queue(&lv).unwrap();
    assert_eq!(report.discarded.len(), 3);
    assert!(!report.discarded.contains(&issued));
    // One dump for the remove above, one at teardown.
    assert_eq!(report.dumps_emitted, 2);
    assert_eq!(report.dump.unwrap().size, 3);
    assert!(manager.is_empty());
}

#[test]
fn test_dump_all_reports_every_volume() {
    let manager = WorkQueueManager::new(WorkQueueManagerConfig::for_testing()).unwrap();
    for n in 0..3_u64 {
        let key = LvKey::new(format!("/dev/bb/d{n}"), Uuid::new_v4()).unwrap();
        manager
            .add_work_queue(key.clone(), LvInfoHandle::new(n), JobId::new(n), n == 1, 0)
            .unwrap();
        manager.set_throttle_rate(&key, n * 1_000, 0).unwrap();
    }

    let snapshots = manager.dump(Level::INFO, "dump_all");
    assert_eq!(snapshots.len(), 3);
    let rates: Vec<u64> = snapshots.iter().map(|s| s.rate).collect();
    assert_eq!(rates, vec![0, 1_000, 2_000]);
    assert!(snapshots[1].suspended);
    assert!(snapshots.iter().all(|s| s.locked_by.is_none()));

    let json = serde_json::to_string(&snapshots).unwrap();
    assert!(json.contains("\"lv_key\":\"/dev/bb/d0:"));
}
