//! Reaper pipeline supervisor
//!
//! Owns the monitor, detector and cleaner and connects them through their
//! event ports:
//! - monitor `ScanComplete` refreshes the detector's tracked set
//! - detector `ZombieConfirmed` queues a cleanup with a priority hint
//! - cleaner outcomes flow back into the detector's `cleanupStatus`

use crate::cleaner::ProcessCleaner;
use crate::config::ReaperConfig;
use crate::core::events::{CleanerEvent, DetectorEvent, MonitorEvent};
use crate::core::models::{CleanupPriority, ImpactLevel, ZombieCleanupStatus, ZombieProcessInfo};
use crate::detector::ZombieDetector;
use crate::error::{ReaperError, ReaperResult};
use crate::monitor::ProcessMonitor;
use crate::platform::{self, ProcessController, ProcessEnumerator};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const SUPERVISOR_INITIATOR: &str = "reaper_supervisor";

pub struct ReaperSupervisor {
    config: ReaperConfig,
    monitor: Arc<ProcessMonitor>,
    detector: Arc<ZombieDetector>,
    cleaner: Arc<ProcessCleaner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaperSupervisor {
    pub fn new(
        config: ReaperConfig,
        enumerator: Arc<dyn ProcessEnumerator>,
        controller: Arc<dyn ProcessController>,
    ) -> ReaperResult<Self> {
        config.validate()?;
        let monitor = Arc::new(ProcessMonitor::new(config.monitor.clone(), enumerator));
        let detector = Arc::new(ZombieDetector::new(config.detector.clone())?);
        let cleaner = Arc::new(ProcessCleaner::new(config.cleaner.clone(), controller)?);
        Ok(Self {
            config,
            monitor,
            detector,
            cleaner,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build a supervisor over this host's process table
    pub fn with_platform_defaults(config: ReaperConfig) -> ReaperResult<Self> {
        Self::new(
            config,
            platform::default_enumerator(),
            platform::default_controller(),
        )
    }

    pub fn monitor(&self) -> &Arc<ProcessMonitor> {
        &self.monitor
    }

    pub fn detector(&self) -> &Arc<ZombieDetector> {
        &self.detector
    }

    pub fn cleaner(&self) -> &Arc<ProcessCleaner> {
        &self.cleaner
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Wire the event ports, then start the detector and the monitor
    pub async fn start(&self) {
        {
            let mut tasks = self.tasks.lock();
            if !tasks.is_empty() {
                warn!("reaper supervisor already running");
                return;
            }
            tasks.push(tokio::spawn(forward_snapshots(
                self.monitor.subscribe(),
                Arc::clone(&self.detector),
            )));
            tasks.push(tokio::spawn(forward_confirmations(
                self.detector.subscribe(),
                Arc::clone(&self.detector),
                Arc::clone(&self.cleaner),
                self.config.cleaner.max_retries,
            )));
            tasks.push(tokio::spawn(forward_outcomes(
                self.cleaner.subscribe(),
                Arc::clone(&self.detector),
            )));
        }

        info!("starting reaper pipeline");
        self.detector.start();
        self.monitor.start().await;
    }

    /// Stop scanning and analysis; in-flight cleanups run to completion
    pub fn stop(&self) {
        self.monitor.stop();
        self.detector.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("reaper pipeline stopped");
    }

    pub async fn run_until<F>(&self, shutdown: F) -> ReaperResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await;
        shutdown.await;
        self.stop();
        Ok(())
    }
}

impl Drop for ReaperSupervisor {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Cleanup priority derived from a zombie's impact levels
pub fn priority_hint(zombie: &ZombieProcessInfo) -> CleanupPriority {
    match (zombie.resource_impact, zombie.system_impact) {
        (ImpactLevel::High, ImpactLevel::High) => CleanupPriority::Critical,
        (ImpactLevel::High, _) | (_, ImpactLevel::High) => CleanupPriority::High,
        (ImpactLevel::Medium, _) | (_, ImpactLevel::Medium) => CleanupPriority::Medium,
        (ImpactLevel::Low, ImpactLevel::Low) => CleanupPriority::Low,
    }
}

/// Queue a confirmed zombie unless it is busy, ignored or out of budget
fn dispatch_confirmed(
    zombie: &ZombieProcessInfo,
    detector: &ZombieDetector,
    cleaner: &ProcessCleaner,
    max_retries: u32,
) {
    match zombie.cleanup_status {
        ZombieCleanupStatus::Ignored | ZombieCleanupStatus::InProgress => return,
        ZombieCleanupStatus::Pending
        | ZombieCleanupStatus::Failed
        | ZombieCleanupStatus::Success => {}
    }

    if zombie.cleanup_attempts >= max_retries {
        warn!(
            pid = zombie.pid(),
            attempts = zombie.cleanup_attempts,
            "cleanup budget exhausted, ignoring zombie"
        );
        detector.mark_ignored(zombie.pid());
        return;
    }

    let priority = priority_hint(zombie);
    cleaner.queue_with_origin(
        zombie,
        priority,
        crate::cleaner::DEFAULT_SOURCE,
        SUPERVISOR_INITIATOR,
    );
}

async fn forward_snapshots(
    mut rx: broadcast::Receiver<MonitorEvent>,
    detector: Arc<ZombieDetector>,
) {
    loop {
        match rx.recv().await {
            Ok(MonitorEvent::ScanComplete(snapshot)) => detector.update_tracked(snapshot),
            Ok(MonitorEvent::Error(err)) => {
                escalate_if_fatal("monitor", &err);
            }
            Ok(MonitorEvent::ProcessDetected(_)) | Ok(MonitorEvent::ZombieIdentified(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "snapshot forwarder lagging behind monitor")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_confirmations(
    mut rx: broadcast::Receiver<DetectorEvent>,
    detector: Arc<ZombieDetector>,
    cleaner: Arc<ProcessCleaner>,
    max_retries: u32,
) {
    loop {
        match rx.recv().await {
            Ok(DetectorEvent::ZombieConfirmed(zombie)) => {
                dispatch_confirmed(&zombie, &detector, &cleaner, max_retries)
            }
            Ok(DetectorEvent::Error(err)) => {
                escalate_if_fatal("detector", &err);
            }
            Ok(DetectorEvent::AnalysisComplete(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "confirmation forwarder lagging behind detector")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_outcomes(mut rx: broadcast::Receiver<CleanerEvent>, detector: Arc<ZombieDetector>) {
    loop {
        match rx.recv().await {
            Ok(CleanerEvent::CleanupQueued(op)) => {
                detector.apply_cleanup_outcome(op.pid, ZombieCleanupStatus::InProgress);
            }
            Ok(CleanerEvent::CleanupSuccess(op)) => {
                detector.apply_cleanup_outcome(op.pid, ZombieCleanupStatus::Success);
            }
            Ok(CleanerEvent::CleanupFailed(op)) => {
                detector.apply_cleanup_outcome(op.pid, ZombieCleanupStatus::Failed);
            }
            Ok(CleanerEvent::Error(err)) => {
                escalate_if_fatal("cleaner", &err);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "outcome forwarder lagging behind cleaner")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// 可恢复的错误已由组件自己记录，这里只升级需要人工处理的
fn escalate_if_fatal(component: &'static str, err: &ReaperError) -> bool {
    if err.is_recoverable() {
        debug!(component, error = %err, "component recovered from error");
        return false;
    }
    error!(
        component,
        category = %err.category(),
        error = %err,
        "component error needs operator attention"
    );
    true
}
