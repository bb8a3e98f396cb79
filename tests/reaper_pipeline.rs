//! 端到端回收流程测试
//!
//! Runs the full monitor → detector → cleaner pipeline over an in-memory
//! process table.

use aiw_reaper::config::{CleanerConfig, DetectorConfig, MonitorConfig, ReaperConfig};
use aiw_reaper::{
    CleanupStatus, InMemoryProcessTable, ProcessSample, ProcessStatus, ReapSignal,
    ReaperSupervisor, ZombieCleanupStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn fast_config(max_retries: u32) -> ReaperConfig {
    ReaperConfig {
        monitor: MonitorConfig {
            scan_interval_ms: 40,
            scan_timeout_ms: 2_000,
        },
        detector: DetectorConfig {
            analysis_interval_ms: 40,
            ..DetectorConfig::default()
        },
        cleaner: CleanerConfig {
            max_retries,
            retry_delay_ms: 5,
            cleanup_timeout_ms: 2_000,
            ..CleanerConfig::default()
        },
    }
}

fn host_table() -> InMemoryProcessTable {
    InMemoryProcessTable::with_processes([
        ProcessSample::new(1, 0, "init", ProcessStatus::Sleeping),
        ProcessSample::new(200, 1, "aiw", ProcessStatus::Sleeping).with_cpu_usage(2.5),
    ])
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orphaned_zombie_is_detected_and_reclaimed() {
    let table = Arc::new(host_table());
    // parent 61_499 is gone; idle for ten minutes
    table.insert(
        ProcessSample::new(61_500, 61_499, "claude", ProcessStatus::Zombie)
            .with_elapsed_secs(600),
    );
    table.exit_on_signal(61_500, ReapSignal::Terminate);

    let supervisor = ReaperSupervisor::new(fast_config(3), table.clone(), table.clone()).unwrap();
    supervisor.start().await;

    let cleaner = Arc::clone(supervisor.cleaner());
    wait_until("cleanup success", || cleaner.stats().succeeded == 1).await;

    let op = cleaner
        .get_completed_cleanups(None)
        .into_iter()
        .find(|op| op.pid == 61_500)
        .expect("operation for pid 61500");
    assert_eq!(op.status, CleanupStatus::Success);
    assert_eq!(op.initiated_by, "reaper_supervisor");
    let methods: Vec<bool> = op.method_history.iter().map(|a| a.success).collect();
    assert_eq!(methods, vec![false, true]);
    assert!(!table.contains(61_500));

    let detector = Arc::clone(supervisor.detector());
    wait_until("zombie record removal", || detector.get_zombie(61_500).is_none()).await;
    assert!(table.signals_sent().iter().all(|(pid, _)| *pid == 61_500));

    supervisor.stop();
    assert!(!supervisor.monitor().is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stubborn_zombie_is_ignored_after_retry_budget() {
    let table = Arc::new(host_table());
    table.insert(
        ProcessSample::new(61_600, 61_599, "codex", ProcessStatus::Zombie)
            .with_elapsed_secs(600),
    );
    table.fail_signal(61_600, ReapSignal::Terminate);
    table.fail_signal(61_600, ReapSignal::Kill);

    let supervisor = ReaperSupervisor::new(fast_config(2), table.clone(), table.clone()).unwrap();
    supervisor.start().await;

    let detector = Arc::clone(supervisor.detector());
    wait_until("zombie to be ignored", || {
        detector
            .get_zombie(61_600)
            .is_some_and(|z| z.cleanup_status == ZombieCleanupStatus::Ignored)
    })
    .await;

    let zombie = detector.get_zombie(61_600).unwrap();
    assert!(zombie.cleanup_attempts >= 2);
    assert!(supervisor.cleaner().stats().failed >= 2);
    assert!(table.contains(61_600));

    supervisor.stop();
}

#[tokio::test]
async fn healthy_processes_are_left_alone() {
    let table = Arc::new(host_table());
    let supervisor = ReaperSupervisor::new(fast_config(3), table.clone(), table.clone()).unwrap();
    supervisor.start().await;

    sleep(Duration::from_millis(200)).await;
    assert!(supervisor.detector().get_zombies().is_empty());
    assert!(supervisor.cleaner().get_completed_cleanups(None).is_empty());
    assert!(table.signals_sent().is_empty());

    supervisor.stop();
}
