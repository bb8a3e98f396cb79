//! 僵尸进程检测
//!
//! Scores every tracked process with the enabled heuristics and promotes the
//! ones above the confidence threshold into [`ZombieProcessInfo`] records.
//! The tracked set is the detector's own copy, refreshed from monitor
//! snapshots through [`ZombieDetector::update_tracked`].

pub mod methods;

use crate::config::DetectorConfig;
use crate::core::events::{DetectorEvent, EventPort};
use crate::core::models::{
    DetectionMethod, MethodResult, ProcessInfo, ZombieCleanupStatus, ZombieProcessInfo,
};
use crate::core::scan_gate::{ScanGate, ScanOutcome};
use crate::error::{errors, ReaperResult};
use chrono::{DateTime, Utc};
use methods::{AnalysisContext, IDLE_CPU_PERCENT};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct ZombieDetector {
    inner: Arc<DetectorInner>,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

struct DetectorInner {
    config: DetectorConfig,
    tracked: RwLock<HashMap<u32, ProcessInfo>>,
    /// Last scan in which each (pid, name) was seen using CPU
    last_active: Mutex<HashMap<u32, (String, DateTime<Utc>)>>,
    zombies: RwLock<HashMap<u32, ZombieProcessInfo>>,
    /// Cleanup operations started per (pid, name), kept across reclamation
    attempt_ledger: Mutex<HashMap<u32, (String, u32)>>,
    gate: ScanGate,
    events: EventPort<DetectorEvent>,
}

impl ZombieDetector {
    pub fn new(config: DetectorConfig) -> ReaperResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DetectorInner {
                config,
                tracked: RwLock::new(HashMap::new()),
                last_active: Mutex::new(HashMap::new()),
                zombies: RwLock::new(HashMap::new()),
                attempt_ledger: Mutex::new(HashMap::new()),
                gate: ScanGate::new(),
                events: EventPort::default(),
            }),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    /// Re-analyze the tracked set every `analysisIntervalMs`
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("zombie detector already running");
            return;
        }

        info!(
            interval_ms = self.inner.config.analysis_interval_ms,
            methods = ?self.inner.config.detection_methods,
            "starting zombie detector"
        );
        let inner = Arc::clone(&self.inner);
        let period = self.inner.config.analysis_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.run_cycle();
            }
        });
        *self.ticker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
            info!("zombie detector stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the tracked set with a monitor snapshot
    pub fn update_tracked(&self, snapshot: Vec<ProcessInfo>) {
        self.inner.update_tracked(snapshot);
    }

    /// Score one process; `Ok(None)` when it stays below the threshold
    pub fn analyze_process(&self, process: &ProcessInfo) -> ReaperResult<Option<ZombieProcessInfo>> {
        self.inner.analyze(process, Utc::now())
    }

    pub fn run_analysis_cycle(&self) -> ScanOutcome {
        self.inner.run_cycle()
    }

    pub fn get_zombies(&self) -> Vec<ZombieProcessInfo> {
        let mut zombies: Vec<ZombieProcessInfo> =
            self.inner.zombies.read().values().cloned().collect();
        zombies.sort_by_key(|z| z.pid());
        zombies
    }

    pub fn get_zombie(&self, pid: u32) -> Option<ZombieProcessInfo> {
        self.inner.zombies.read().get(&pid).cloned()
    }

    /// Fold a cleanup result back into the zombie record
    ///
    /// `InProgress` counts a started operation, `Success` drops the record.
    /// Returns false when the pid is not a confirmed zombie.
    pub fn apply_cleanup_outcome(&self, pid: u32, status: ZombieCleanupStatus) -> bool {
        let mut zombies = self.inner.zombies.write();
        let Some(zombie) = zombies.get_mut(&pid) else {
            return false;
        };

        match status {
            ZombieCleanupStatus::InProgress => {
                zombie.cleanup_attempts = zombie.cleanup_attempts.saturating_add(1);
                zombie.cleanup_status = status;
                self.inner.attempt_ledger.lock().insert(
                    pid,
                    (zombie.process.name.clone(), zombie.cleanup_attempts),
                );
            }
            ZombieCleanupStatus::Success => {
                zombies.remove(&pid);
                debug!(pid, "zombie reclaimed");
            }
            _ => zombie.cleanup_status = status,
        }
        true
    }

    pub fn mark_ignored(&self, pid: u32) -> bool {
        self.apply_cleanup_outcome(pid, ZombieCleanupStatus::Ignored)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for ZombieDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

impl DetectorInner {
    fn update_tracked(&self, snapshot: Vec<ProcessInfo>) {
        let present: HashMap<u32, &str> = snapshot.iter().map(|p| (p.pid, p.name.as_str())).collect();

        {
            let mut last_active = self.last_active.lock();
            last_active.retain(|pid, (name, _)| {
                present.get(pid).is_some_and(|current| *current == name.as_str())
            });
            for process in &snapshot {
                if process.cpu_usage >= IDLE_CPU_PERCENT {
                    last_active.insert(
                        process.pid,
                        (process.name.clone(), process.scan_timestamp),
                    );
                }
            }
        }

        // Gone or reused pids cannot be cleaned up any more
        self.zombies.write().retain(|pid, zombie| {
            present.get(pid).is_some_and(|name| *name == zombie.process.name)
        });
        self.attempt_ledger
            .lock()
            .retain(|pid, (name, _)| present.get(pid).is_some_and(|current| *current == name.as_str()));

        let tracked: HashMap<u32, ProcessInfo> =
            snapshot.into_iter().map(|p| (p.pid, p)).collect();
        *self.tracked.write() = tracked;
    }

    /// Score one process against the current zombie map
    fn analyze(
        &self,
        process: &ProcessInfo,
        now: DateTime<Utc>,
    ) -> ReaperResult<Option<ZombieProcessInfo>> {
        let Some(mut zombie) = self.score(process, now)? else {
            return Ok(None);
        };
        let zombies = self.zombies.read();
        self.carry_history(&mut zombie, zombies.get(&process.pid));
        Ok(Some(zombie))
    }

    /// Fresh record for `process`, without any history carried over
    fn score(
        &self,
        process: &ProcessInfo,
        now: DateTime<Utc>,
    ) -> ReaperResult<Option<ZombieProcessInfo>> {
        process.validate()?;

        let idle_since = self
            .last_active
            .lock()
            .get(&process.pid)
            .filter(|(name, _)| *name == process.name)
            .map(|(_, seen)| *seen)
            .unwrap_or(process.start_time);
        let ctx = AnalysisContext {
            now,
            idle_since,
            staleness_threshold: self.config.staleness_threshold(),
        };

        let results: Vec<MethodResult> = self
            .config
            .detection_methods
            .iter()
            .map(|method| methods::evaluate(*method, process, &ctx))
            .collect();

        for failed in results.iter().filter(|r| r.error.is_some()) {
            let message = failed.error.clone().unwrap_or_default();
            debug!(pid = process.pid, method = %failed.method, %message, "heuristic degraded");
            self.events.emit(DetectorEvent::Error(Arc::new(errors::analysis_error(
                process.pid,
                failed.method.as_str(),
                message,
            ))));
        }

        let confidence = methods::ensemble_confidence(&results);
        if confidence < self.config.confidence_threshold {
            return Ok(None);
        }

        let detection_methods: Vec<DetectionMethod> =
            results.iter().filter(|r| r.fired).map(|r| r.method).collect();
        Ok(Some(ZombieProcessInfo {
            process: process.clone(),
            zombie_confidence: confidence,
            detection_methods,
            resource_impact: methods::resource_impact(process.memory_usage),
            system_impact: methods::system_impact(&results),
            method_results: results,
            first_detected: now,
            last_confirmed: now,
            zombie_lifetime_secs: 0,
            cleanup_attempts: 0,
            cleanup_status: ZombieCleanupStatus::Pending,
        }))
    }

    /// Inherit from the live record of the same process, else from the attempt ledger
    fn carry_history(&self, zombie: &mut ZombieProcessInfo, current: Option<&ZombieProcessInfo>) {
        if let Some(current) = current.filter(|c| c.process.name == zombie.process.name) {
            zombie.inherit_from(current);
            return;
        }
        if let Some((name, attempts)) = self.attempt_ledger.lock().get(&zombie.pid()) {
            if *name == zombie.process.name {
                zombie.cleanup_attempts = *attempts;
            }
        }
    }

    fn run_cycle(&self) -> ScanOutcome {
        let Some(_permit) = self.gate.try_enter() else {
            debug!("analysis already in flight, dropping this tick");
            return ScanOutcome::Skipped;
        };
        let scores = self.score_tracked(Utc::now());
        self.commit(scores)
    }

    /// Score the tracked set without touching the zombie map
    fn score_tracked(&self, now: DateTime<Utc>) -> CycleScores {
        let known_before: HashSet<u32> = self.zombies.read().keys().copied().collect();
        let mut processes: Vec<ProcessInfo> = self.tracked.read().values().cloned().collect();
        processes.sort_by_key(|p| p.pid);

        let mut confirmed = Vec::new();
        let mut cleared = HashSet::new();
        for process in &processes {
            match self.score(process, now) {
                Ok(Some(zombie)) => confirmed.push(zombie),
                Ok(None) => {
                    cleared.insert(process.pid);
                }
                Err(err) => {
                    warn!(pid = process.pid, error = %err, "skipping process this cycle");
                    self.events.emit(DetectorEvent::Error(Arc::new(err)));
                }
            }
        }

        CycleScores {
            analyzed: processes.len(),
            known_before,
            confirmed,
            cleared,
        }
    }

    /// Merge scores into the zombie map under its write lock
    ///
    /// History is inherited from the entry present at merge time, so cleanup
    /// outcomes applied while the cycle was scoring are kept. A record that
    /// disappeared mid-cycle (reclaimed or gone) is not brought back.
    fn commit(&self, scores: CycleScores) -> ScanOutcome {
        let CycleScores {
            analyzed,
            known_before,
            confirmed,
            cleared,
        } = scores;

        let mut merged = Vec::with_capacity(confirmed.len());
        let mut newly_confirmed = HashSet::new();
        {
            let mut zombies = self.zombies.write();
            zombies.retain(|pid, _| !cleared.contains(pid));
            for mut zombie in confirmed {
                let pid = zombie.pid();
                let current = zombies.get(&pid);
                if current.is_none() && known_before.contains(&pid) {
                    debug!(pid, "zombie record removed mid-cycle, not restoring it");
                    continue;
                }
                if current.is_none() {
                    newly_confirmed.insert(pid);
                }
                self.carry_history(&mut zombie, current);
                zombies.insert(pid, zombie.clone());
                merged.push(zombie);
            }
        }

        for zombie in &merged {
            if newly_confirmed.contains(&zombie.pid()) {
                info!(
                    pid = zombie.pid(),
                    name = %zombie.process.name,
                    confidence = zombie.zombie_confidence,
                    methods = ?zombie.detection_methods,
                    "zombie confirmed"
                );
            }
            self.events.emit(DetectorEvent::ZombieConfirmed(zombie.clone()));
        }
        debug!(analyzed, confirmed = merged.len(), "analysis cycle complete");
        let count = merged.len();
        self.events.emit(DetectorEvent::AnalysisComplete(merged));
        ScanOutcome::Completed(count)
    }
}

/// Output of the scoring half of an analysis cycle
struct CycleScores {
    analyzed: usize,
    /// Pids that had a zombie record when scoring started
    known_before: HashSet<u32>,
    confirmed: Vec<ZombieProcessInfo>,
    cleared: HashSet<u32>,
}
