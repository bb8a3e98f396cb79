//! 进程监控
//!
//! Periodically enumerates the OS process table, normalizes every row into a
//! [`ProcessInfo`] snapshot and publishes discovery events. Enumeration runs
//! on the blocking pool under a single in-flight guard; a failed pass keeps
//! the previous snapshot.

use crate::config::MonitorConfig;
use crate::core::events::{EventPort, MonitorEvent};
use crate::core::models::{ProcessInfo, ProcessSample};
use crate::core::scan_gate::{ScanGate, ScanOutcome};
use crate::error::{errors, ReaperError};
use crate::platform::ProcessEnumerator;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scan counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    pub scans_completed: u64,
    pub scans_skipped: u64,
    pub scans_failed: u64,
    pub tracked_processes: usize,
    pub zombie_processes: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
}

pub struct ProcessMonitor {
    inner: Arc<MonitorInner>,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

struct MonitorInner {
    config: MonitorConfig,
    enumerator: Arc<dyn ProcessEnumerator>,
    cache: RwLock<HashMap<u32, ProcessInfo>>,
    /// Held until the blocking enumeration returns, even past a timeout
    gate: Arc<ScanGate>,
    events: EventPort<MonitorEvent>,
    stats: Mutex<MonitorStats>,
}

impl ProcessMonitor {
    pub fn new(config: MonitorConfig, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                enumerator,
                cache: RwLock::new(HashMap::new()),
                gate: Arc::new(ScanGate::new()),
                events: EventPort::default(),
                stats: Mutex::new(MonitorStats::default()),
            }),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }
    }

    /// Scan once, then keep scanning every `scanIntervalMs`
    ///
    /// Calling `start` on a running monitor logs a warning and does nothing.
    pub async fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("process monitor already running");
            return;
        }

        let period = self.inner.config.scan_interval();
        info!(
            enumerator = self.inner.enumerator.name(),
            interval_ms = self.inner.config.scan_interval_ms,
            "starting process monitor"
        );
        self.inner.scan().await;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.scan().await;
            }
        });
        *self.ticker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            info!("process monitor stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one scan pass now; dropped if another pass is in flight
    pub async fn scan(&self) -> ScanOutcome {
        self.inner.scan().await
    }

    pub fn get_tracked_processes(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = self.inner.cache.read().values().cloned().collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }

    pub fn get_zombie_processes(&self) -> Vec<ProcessInfo> {
        let mut zombies: Vec<ProcessInfo> = self
            .inner
            .cache
            .read()
            .values()
            .filter(|p| p.is_zombie)
            .cloned()
            .collect();
        zombies.sort_by_key(|p| p.pid);
        zombies
    }

    pub fn get_process(&self, pid: u32) -> Option<ProcessInfo> {
        self.inner.cache.read().get(&pid).cloned()
    }

    pub fn stats(&self) -> MonitorStats {
        let mut stats = self.inner.stats.lock().clone();
        let cache = self.inner.cache.read();
        stats.tracked_processes = cache.len();
        stats.zombie_processes = cache.values().filter(|p| p.is_zombie).count();
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

impl MonitorInner {
    async fn scan(&self) -> ScanOutcome {
        let Some(permit) = self.gate.try_enter_owned() else {
            debug!("scan already in flight, dropping this tick");
            self.stats.lock().scans_skipped += 1;
            return ScanOutcome::Skipped;
        };

        let enumerator = Arc::clone(&self.enumerator);
        let mut enumeration = tokio::task::spawn_blocking(move || enumerator.enumerate());

        let samples = match time::timeout(self.config.scan_timeout(), &mut enumeration).await {
            Ok(Ok(Ok(samples))) => samples,
            Ok(Ok(Err(err))) => return self.fail(err),
            Ok(Err(join_err)) => {
                return self.fail(errors::introspection_error(format!(
                    "enumerator task failed: {join_err}"
                )))
            }
            Err(_) => {
                // 阻塞任务仍在运行，返回前不释放扫描状态
                tokio::spawn(async move {
                    let _ = enumeration.await;
                    drop(permit);
                    debug!("timed-out enumeration finally returned");
                });
                return self.fail(errors::timeout_error(
                    "process enumeration",
                    self.config.scan_timeout_ms,
                ));
            }
        };

        let count = self.apply_snapshot(samples, Utc::now());
        drop(permit);
        ScanOutcome::Completed(count)
    }

    fn fail(&self, err: ReaperError) -> ScanOutcome {
        warn!(error = %err, "process scan failed, keeping previous snapshot");
        self.stats.lock().scans_failed += 1;
        self.events.emit(MonitorEvent::Error(Arc::new(err)));
        ScanOutcome::Failed
    }

    /// Replace the cache with a new snapshot and publish what changed
    fn apply_snapshot(&self, samples: Vec<ProcessSample>, scanned_at: DateTime<Utc>) -> usize {
        let present: HashSet<u32> = samples.iter().map(|s| s.pid).collect();

        let mut snapshot: Vec<ProcessInfo> = Vec::with_capacity(samples.len());
        let mut detected = Vec::new();
        let mut newly_zombie = Vec::new();
        {
            let mut cache = self.cache.write();
            for sample in &samples {
                let parent_exists = sample.ppid == 0 || present.contains(&sample.ppid);
                let mut info = ProcessInfo::from_sample(sample, parent_exists, scanned_at);

                match cache.get(&sample.pid) {
                    Some(previous) => {
                        if info.is_zombie && previous.is_zombie {
                            info.zombie_since = previous.zombie_since.or(info.zombie_since);
                        } else if info.is_zombie {
                            newly_zombie.push(info.clone());
                        }
                    }
                    None => {
                        detected.push(info.clone());
                        if info.is_zombie {
                            newly_zombie.push(info.clone());
                        }
                    }
                }
                snapshot.push(info);
            }

            snapshot.sort_by_key(|p| p.pid);
            *cache = snapshot.iter().map(|p| (p.pid, p.clone())).collect();
        }

        {
            let mut stats = self.stats.lock();
            stats.scans_completed += 1;
            stats.last_scan_at = Some(scanned_at);
        }
        debug!(
            processes = snapshot.len(),
            new = detected.len(),
            new_zombies = newly_zombie.len(),
            "scan complete"
        );

        for info in detected {
            self.events.emit(MonitorEvent::ProcessDetected(info));
        }
        for info in newly_zombie {
            info!(pid = info.pid, name = %info.name, status = %info.status, "zombie identified");
            self.events.emit(MonitorEvent::ZombieIdentified(info));
        }
        let count = snapshot.len();
        self.events.emit(MonitorEvent::ScanComplete(snapshot));
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ProcessStatus;
    use crate::platform::InMemoryProcessTable;
    use std::time::Duration;

    fn init() -> ProcessSample {
        ProcessSample::new(1, 0, "init", ProcessStatus::Sleeping)
    }

    fn monitor_over(table: &Arc<InMemoryProcessTable>) -> ProcessMonitor {
        let config = MonitorConfig {
            scan_interval_ms: 3_600_000,
            scan_timeout_ms: 5_000,
        };
        ProcessMonitor::new(config, table.clone())
    }

    #[tokio::test]
    async fn zombie_child_of_init_is_identified() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            init(),
            ProcessSample::new(500, 1, "claude", ProcessStatus::Zombie),
        ]));
        let monitor = monitor_over(&table);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.scan().await, ScanOutcome::Completed(2));

        let zombies = monitor.get_zombie_processes();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].pid, 500);
        assert!(zombies[0].parent_exists);
        assert!(zombies[0].zombie_since.is_some());

        let mut identified = Vec::new();
        let mut snapshot_len = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                MonitorEvent::ZombieIdentified(info) => identified.push(info.pid),
                MonitorEvent::ScanComplete(list) => snapshot_len = Some(list.len()),
                _ => {}
            }
        }
        assert_eq!(identified, vec![500]);
        assert_eq!(snapshot_len, Some(2));
    }

    #[tokio::test]
    async fn orphaned_process_is_marked_zombie() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            init(),
            ProcessSample::new(300, 299, "node", ProcessStatus::Sleeping),
        ]));
        let monitor = monitor_over(&table);
        monitor.scan().await;

        let orphan = monitor.get_process(300).unwrap();
        assert!(!orphan.parent_exists);
        assert!(orphan.is_zombie);
        assert!(!monitor.get_process(1).unwrap().is_zombie);
    }

    #[tokio::test]
    async fn concurrent_scans_enumerate_once() {
        let table = Arc::new(InMemoryProcessTable::with_processes([init()]));
        table.set_latency(Duration::from_millis(200));
        let monitor = monitor_over(&table);

        let (first, second) = tokio::join!(monitor.scan(), monitor.scan());
        let mut outcomes = vec![first, second];
        outcomes.sort_by_key(|o| matches!(o, ScanOutcome::Skipped));
        assert_eq!(outcomes, vec![ScanOutcome::Completed(1), ScanOutcome::Skipped]);
        assert_eq!(table.enumeration_count(), 1);
        assert_eq!(monitor.stats().scans_skipped, 1);
    }

    #[tokio::test]
    async fn timed_out_enumeration_blocks_new_scans_until_it_returns() {
        let table = Arc::new(InMemoryProcessTable::with_processes([init()]));
        table.set_latency(Duration::from_millis(300));
        let monitor = ProcessMonitor::new(
            MonitorConfig {
                scan_interval_ms: 3_600_000,
                scan_timeout_ms: 50,
            },
            table.clone(),
        );

        assert_eq!(monitor.scan().await, ScanOutcome::Failed);
        assert_eq!(monitor.scan().await, ScanOutcome::Skipped);
        assert_eq!(monitor.scan().await, ScanOutcome::Skipped);
        assert_eq!(table.enumeration_count(), 1);

        // once the stuck enumeration returns the gate opens again
        table.set_latency(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.scan().await, ScanOutcome::Completed(1));
        assert_eq!(table.enumeration_count(), 2);

        let stats = monitor.stats();
        assert_eq!(stats.scans_failed, 1);
        assert_eq!(stats.scans_skipped, 2);
    }

    #[tokio::test]
    async fn failed_enumeration_keeps_previous_snapshot() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            init(),
            ProcessSample::new(42, 1, "worker", ProcessStatus::Running),
        ]));
        let monitor = monitor_over(&table);
        monitor.scan().await;

        table.set_enumeration_failure(Some("ps: permission denied"));
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.scan().await, ScanOutcome::Failed);
        assert_eq!(monitor.get_tracked_processes().len(), 2);
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::Error(_))));
        assert_eq!(monitor.stats().scans_failed, 1);
    }

    #[tokio::test]
    async fn zombie_since_is_carried_across_scans() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            init(),
            ProcessSample::new(77, 1, "helper", ProcessStatus::Zombie),
        ]));
        let monitor = monitor_over(&table);
        monitor.scan().await;
        let first = monitor.get_process(77).unwrap().zombie_since;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut rx = monitor.subscribe();
        monitor.scan().await;
        assert_eq!(monitor.get_process(77).unwrap().zombie_since, first);

        // nothing new on the second pass
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, MonitorEvent::ScanComplete(_)));
        }
    }

    #[tokio::test]
    async fn vanished_processes_are_evicted() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            init(),
            ProcessSample::new(42, 1, "worker", ProcessStatus::Running),
        ]));
        let monitor = monitor_over(&table);
        monitor.scan().await;
        table.remove(42);
        monitor.scan().await;
        assert!(monitor.get_process(42).is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let table = Arc::new(InMemoryProcessTable::with_processes([init()]));
        let monitor = monitor_over(&table);

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running());
        assert_eq!(table.enumeration_count(), 1);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
