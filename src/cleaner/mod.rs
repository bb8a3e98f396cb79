//! 进程清理
//!
//! Drives confirmed zombies through an escalating list of reclamation methods.
//! Operations wait in a strict-priority queue and at most
//! `parallelCleanupLimit` of them run at once. Every attempt is timed and
//! recorded; errors, panics and timeouts inside an attempt only fail that
//! attempt.

pub mod queue;

use crate::config::CleanerConfig;
use crate::core::events::{CleanerEvent, EventPort};
use crate::core::models::{
    CleanupMethod, CleanupMethodAttempt, CleanupOperation, CleanupPriority, CleanupStatus,
    FailureReason, ZombieProcessInfo,
};
use crate::error::{errors, ReaperError, ReaperResult};
use crate::platform::{is_protected_pid, ProcessController, ReapSignal};
use chrono::Utc;
use parking_lot::Mutex;
use queue::{CompletedRing, PriorityQueue};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SOURCE: &str = "zombie_detector";
pub const DEFAULT_INITIATOR: &str = "process_cleaner";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanerStats {
    pub pending: usize,
    pub active: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub resources_freed: u64,
}

pub struct ProcessCleaner {
    inner: Arc<CleanerInner>,
}

struct CleanerInner {
    config: CleanerConfig,
    controller: Arc<dyn ProcessController>,
    state: Mutex<CleanerState>,
    events: EventPort<CleanerEvent>,
}

struct CleanerState {
    pending: PriorityQueue<CleanupOperation>,
    active: HashMap<String, CleanupOperation>,
    completed: CompletedRing<CleanupOperation>,
    succeeded: u64,
    failed: u64,
    resources_freed: u64,
}

impl ProcessCleaner {
    /// Fails on an empty or duplicated method list and on a zero parallel limit
    pub fn new(config: CleanerConfig, controller: Arc<dyn ProcessController>) -> ReaperResult<Self> {
        config.validate()?;
        let state = CleanerState {
            pending: PriorityQueue::new(),
            active: HashMap::new(),
            completed: CompletedRing::new(config.history_limit),
            succeeded: 0,
            failed: 0,
            resources_freed: 0,
        };
        Ok(Self {
            inner: Arc::new(CleanerInner {
                config,
                controller,
                state: Mutex::new(state),
                events: EventPort::default(),
            }),
        })
    }

    /// Queue a zombie and kick the queue; returns the operation id
    ///
    /// A pid that already has a pending or active operation keeps it.
    pub fn queue_zombie_for_cleanup(
        &self,
        zombie: &ZombieProcessInfo,
        priority: CleanupPriority,
    ) -> String {
        self.queue_with_origin(zombie, priority, DEFAULT_SOURCE, DEFAULT_INITIATOR)
    }

    pub fn queue_with_origin(
        &self,
        zombie: &ZombieProcessInfo,
        priority: CleanupPriority,
        source: &str,
        initiated_by: &str,
    ) -> String {
        let operation = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.find_open(zombie.pid()) {
                debug!(pid = zombie.pid(), operation_id = %existing, "cleanup already queued");
                return existing;
            }
            let operation = CleanupOperation::new(zombie, priority, source, initiated_by);
            state.pending.push(priority, operation.clone());
            operation
        };

        debug!(
            pid = operation.pid,
            priority = %priority,
            operation_id = %operation.operation_id,
            "cleanup queued"
        );
        let operation_id = operation.operation_id.clone();
        self.inner.events.emit(CleanerEvent::CleanupQueued(operation));
        self.inner.process_queue();
        operation_id
    }

    /// Run a single reclamation method against `pid` outside any operation
    pub async fn execute_cleanup_method(&self, pid: u32, method: CleanupMethod) -> ReaperResult<()> {
        self.inner.execute(pid, method).await
    }

    /// Pending operations in dequeue order
    pub fn get_pending_cleanups(&self) -> Vec<CleanupOperation> {
        self.inner.state.lock().pending.iter().cloned().collect()
    }

    pub fn get_active_cleanups(&self) -> Vec<CleanupOperation> {
        let mut active: Vec<CleanupOperation> =
            self.inner.state.lock().active.values().cloned().collect();
        active.sort_by_key(|op| op.started_at);
        active
    }

    /// Completed operations, oldest first; `None` returns the whole history
    pub fn get_completed_cleanups(&self, limit: Option<usize>) -> Vec<CleanupOperation> {
        let state = self.inner.state.lock();
        let limit = limit.unwrap_or(state.completed.len());
        state.completed.recent(limit).cloned().collect()
    }

    pub fn stats(&self) -> CleanerStats {
        let state = self.inner.state.lock();
        CleanerStats {
            pending: state.pending.len(),
            active: state.active.len(),
            succeeded: state.succeeded,
            failed: state.failed,
            resources_freed: state.resources_freed,
        }
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CleanerEvent> {
        self.inner.events.subscribe()
    }
}

impl CleanerState {
    fn find_open(&self, pid: u32) -> Option<String> {
        self.pending
            .iter()
            .chain(self.active.values())
            .find(|op| op.pid == pid)
            .map(|op| op.operation_id.clone())
    }
}

impl CleanerInner {
    /// Start queued operations while below the parallel limit
    fn process_queue(self: &Arc<Self>) {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                warn!("no async runtime available, cleanup operations stay queued");
                self.events.emit(CleanerEvent::Error(Arc::new(errors::runtime_error(
                    format!("cannot schedule cleanup: {err}"),
                ))));
                return;
            }
        };

        loop {
            let operation = {
                let mut state = self.state.lock();
                if state.active.len() >= self.config.parallel_cleanup_limit {
                    break;
                }
                let Some(mut operation) = state.pending.pop() else {
                    break;
                };
                if let Err(err) = operation.transition(CleanupStatus::InProgress) {
                    drop(state);
                    self.report(err);
                    continue;
                }
                state
                    .active
                    .insert(operation.operation_id.clone(), operation.clone());
                operation
            };

            let inner = Arc::clone(self);
            runtime.spawn(async move {
                inner.drive(operation).await;
            });
        }
    }

    async fn drive(self: Arc<Self>, mut operation: CleanupOperation) {
        debug!(
            pid = operation.pid,
            operation_id = %operation.operation_id,
            "cleanup started"
        );

        if self.config.safety_checks {
            if let Err(err) = self.safety_check(&operation).await {
                let reason = match &err {
                    ReaperError::SafetyCheck { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                warn!(pid = operation.pid, %reason, "safety check refused cleanup");
                self.finish(
                    operation,
                    CleanupStatus::Failed,
                    Some(FailureReason::SafetyCheckFailed { reason }),
                );
                return;
            }
        }

        let methods = self.config.cleanup_methods.clone();
        for (index, method) in methods.iter().copied().enumerate() {
            operation.current_method = Some(method);
            self.sync_active(&operation);

            let attempt = self.run_attempt(&operation, method).await;
            let success = attempt.success;
            operation.record_attempt(attempt);
            self.sync_active(&operation);

            if success {
                self.finish(operation, CleanupStatus::Success, None);
                return;
            }

            if index + 1 < methods.len() {
                self.advance(&mut operation, CleanupStatus::Retry);
                tokio::time::sleep(self.config.retry_delay()).await;
                self.advance(&mut operation, CleanupStatus::InProgress);
            }
        }

        let attempts = operation.attempts;
        error!(
            pid = operation.pid,
            attempts,
            "all cleanup methods failed"
        );
        self.events.emit(CleanerEvent::Error(Arc::new(ReaperError::Exhausted {
            pid: operation.pid,
            attempts,
        })));
        self.finish(
            operation,
            CleanupStatus::Failed,
            Some(FailureReason::MethodsExhausted { attempts }),
        );
    }

    async fn run_attempt(&self, operation: &CleanupOperation, method: CleanupMethod) -> CleanupMethodAttempt {
        let started_at = Utc::now();
        let timeout = self.config.cleanup_timeout();
        let result = match tokio::time::timeout(timeout, self.execute(operation.pid, method)).await {
            Ok(result) => result,
            Err(_) => Err(errors::timeout_error(
                format!("{method} on pid {}", operation.pid),
                self.config.cleanup_timeout_ms,
            )),
        };

        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(err) => {
                debug!(pid = operation.pid, %method, error = %err, "cleanup attempt failed");
                (false, Some(err.to_string()))
            }
        };
        let resources_freed = if success && method != CleanupMethod::NotifyParent {
            operation.memory_usage
        } else {
            0
        };

        CleanupMethodAttempt {
            method,
            started_at,
            ended_at: Utc::now(),
            success,
            error,
            resources_freed,
        }
    }

    async fn execute(&self, pid: u32, method: CleanupMethod) -> ReaperResult<()> {
        match method {
            CleanupMethod::LivenessPoll => match self.blocking(move |c| c.probe(pid)).await? {
                None => Ok(()),
                Some(probe) => Err(errors::method_error(
                    pid,
                    method.as_str(),
                    format!("process is still present ({})", probe.status),
                )),
            },
            CleanupMethod::Terminate => {
                self.blocking(move |c| c.send_signal(pid, ReapSignal::Terminate))
                    .await
            }
            CleanupMethod::Kill => {
                self.blocking(move |c| c.send_signal(pid, ReapSignal::Kill))
                    .await
            }
            CleanupMethod::NotifyParent => {
                let probe = self.blocking(move |c| c.probe(pid)).await?.ok_or_else(|| {
                    errors::method_error(pid, method.as_str(), "parent is unknown, process is gone")
                })?;
                if probe.ppid <= 1 {
                    return Err(errors::method_error(
                        pid,
                        method.as_str(),
                        format!("parent pid {} cannot be notified", probe.ppid),
                    ));
                }
                let ppid = probe.ppid;
                self.blocking(move |c| c.send_signal(ppid, ReapSignal::Child))
                    .await
            }
            CleanupMethod::ForceCleanup => {
                if self.blocking(move |c| c.reap(pid)).await? {
                    Ok(())
                } else {
                    Err(errors::method_error(
                        pid,
                        method.as_str(),
                        "process has not exited yet",
                    ))
                }
            }
        }
    }

    /// Re-check the target right before acting on it
    async fn safety_check(&self, operation: &CleanupOperation) -> ReaperResult<()> {
        let pid = operation.pid;
        if is_protected_pid(pid) {
            return Err(errors::safety_error(pid, "protected system or reaper process"));
        }

        let probe = self
            .blocking(move |c| c.probe(pid))
            .await
            .map_err(|err| errors::safety_error(pid, format!("probe failed: {err}")))?;
        match probe {
            None => Err(errors::safety_error(pid, "process no longer exists")),
            Some(probe) if probe.name != operation.process_name => Err(errors::safety_error(
                pid,
                format!(
                    "pid reused: expected '{}', found '{}'",
                    operation.process_name, probe.name
                ),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Run a controller call on the blocking pool; panics become errors
    async fn blocking<T, F>(&self, call: F) -> ReaperResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProcessController) -> ReaperResult<T> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || call(controller.as_ref()))
            .await
            .map_err(|err| errors::runtime_error(format!("controller task failed: {err}")))?
    }

    fn advance(&self, operation: &mut CleanupOperation, next: CleanupStatus) {
        match operation.transition(next) {
            Ok(()) => self.sync_active(operation),
            Err(err) => self.report(err),
        }
    }

    fn sync_active(&self, operation: &CleanupOperation) {
        self.state
            .lock()
            .active
            .insert(operation.operation_id.clone(), operation.clone());
    }

    fn finish(
        self: &Arc<Self>,
        mut operation: CleanupOperation,
        status: CleanupStatus,
        failure_reason: Option<FailureReason>,
    ) {
        if let Err(err) = operation.finish(status, failure_reason) {
            self.report(err);
        }

        {
            let mut state = self.state.lock();
            state.active.remove(&operation.operation_id);
            match operation.status {
                CleanupStatus::Success => {
                    state.succeeded += 1;
                    state.resources_freed =
                        state.resources_freed.saturating_add(operation.resources_freed);
                }
                _ => state.failed += 1,
            }
            state.completed.push(operation.clone());
        }

        match operation.status {
            CleanupStatus::Success => {
                info!(
                    pid = operation.pid,
                    name = %operation.process_name,
                    attempts = operation.attempts,
                    duration_ms = operation.duration_ms.unwrap_or_default(),
                    "cleanup succeeded"
                );
                self.events.emit(CleanerEvent::CleanupSuccess(operation));
            }
            _ => {
                warn!(
                    pid = operation.pid,
                    name = %operation.process_name,
                    reason = ?operation.failure_reason,
                    "cleanup failed"
                );
                self.events.emit(CleanerEvent::CleanupFailed(operation));
            }
        }

        self.process_queue();
    }

    fn report(&self, err: ReaperError) {
        err.log("cleaner");
        self.events.emit(CleanerEvent::Error(Arc::new(err)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{fixtures, ProcessSample, ProcessStatus};
    use crate::platform::InMemoryProcessTable;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config(methods: Vec<CleanupMethod>) -> CleanerConfig {
        CleanerConfig {
            retry_delay_ms: 10,
            cleanup_timeout_ms: 2_000,
            cleanup_methods: methods,
            ..CleanerConfig::default()
        }
    }

    fn live(pid: u32, name: &str) -> ProcessSample {
        ProcessSample::new(pid, 61_000, name, ProcessStatus::Zombie)
    }

    async fn wait_for_completion(cleaner: &ProcessCleaner, count: usize) {
        timeout(Duration::from_secs(10), async {
            while cleaner.get_completed_cleanups(None).len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cleanups should complete");
    }

    #[test]
    fn construction_rejects_bad_configs() {
        let table = Arc::new(InMemoryProcessTable::new());
        assert!(ProcessCleaner::new(config(Vec::new()), table.clone()).is_err());
        assert!(ProcessCleaner::new(
            config(vec![CleanupMethod::Kill, CleanupMethod::Kill]),
            table.clone()
        )
        .is_err());

        let mut zero = config(vec![CleanupMethod::Kill]);
        zero.parallel_cleanup_limit = 0;
        assert!(ProcessCleaner::new(zero, table).is_err());
    }

    #[test]
    fn pending_queue_is_ordered_by_priority() {
        // Without a runtime nothing is dispatched, so the queue stays observable
        let table = Arc::new(InMemoryProcessTable::new());
        let cleaner = ProcessCleaner::new(config(vec![CleanupMethod::Kill]), table).unwrap();
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_001, "a"), CleanupPriority::Low);
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_002, "b"), CleanupPriority::Critical);
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_003, "c"), CleanupPriority::Medium);

        let order: Vec<CleanupPriority> = cleaner
            .get_pending_cleanups()
            .iter()
            .map(|op| op.priority)
            .collect();
        assert_eq!(
            order,
            vec![
                CleanupPriority::Critical,
                CleanupPriority::Medium,
                CleanupPriority::Low
            ]
        );
    }

    #[test]
    fn duplicate_pid_reuses_open_operation() {
        let table = Arc::new(InMemoryProcessTable::new());
        let cleaner = ProcessCleaner::new(config(vec![CleanupMethod::Kill]), table).unwrap();
        let zombie = fixtures::zombie(61_010, "dup");
        let first = cleaner.queue_zombie_for_cleanup(&zombie, CleanupPriority::Low);
        let second = cleaner.queue_zombie_for_cleanup(&zombie, CleanupPriority::High);
        assert_eq!(first, second);
        assert_eq!(cleaner.get_pending_cleanups().len(), 1);
    }

    #[tokio::test]
    async fn escalates_until_a_method_succeeds() {
        let table = Arc::new(InMemoryProcessTable::with_processes([live(61_020, "claude")]));
        table.fail_signal(61_020, ReapSignal::Terminate);
        let cleaner = ProcessCleaner::new(
            config(vec![
                CleanupMethod::LivenessPoll,
                CleanupMethod::Terminate,
                CleanupMethod::Kill,
            ]),
            table.clone(),
        )
        .unwrap();
        let mut rx = cleaner.subscribe();

        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_020, "claude"), CleanupPriority::High);
        wait_for_completion(&cleaner, 1).await;

        let op = &cleaner.get_completed_cleanups(None)[0];
        assert_eq!(op.status, CleanupStatus::Success);
        let outcomes: Vec<bool> = op.method_history.iter().map(|a| a.success).collect();
        assert_eq!(outcomes, vec![false, false, true]);
        assert_eq!(op.attempts, 3);
        assert!(op.ended_at.is_some() && op.duration_ms.is_some());
        assert!(op.current_method.is_none());
        assert_eq!(op.resources_freed, op.memory_usage);

        assert!(matches!(rx.recv().await, Ok(CleanerEvent::CleanupQueued(_))));
        assert!(matches!(rx.recv().await, Ok(CleanerEvent::CleanupSuccess(_))));
    }

    #[tokio::test]
    async fn exhausting_every_method_fails_the_operation() {
        let table = Arc::new(InMemoryProcessTable::with_processes([live(61_030, "codex")]));
        table.fail_signal(61_030, ReapSignal::Terminate);
        table.fail_signal(61_030, ReapSignal::Kill);
        let methods = vec![
            CleanupMethod::LivenessPoll,
            CleanupMethod::Terminate,
            CleanupMethod::Kill,
        ];
        let cleaner = ProcessCleaner::new(config(methods.clone()), table).unwrap();

        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_030, "codex"), CleanupPriority::Low);
        wait_for_completion(&cleaner, 1).await;

        let op = &cleaner.get_completed_cleanups(None)[0];
        assert_eq!(op.status, CleanupStatus::Failed);
        assert_eq!(op.method_history.len(), methods.len());
        assert!(op.method_history.iter().all(|a| !a.success && a.error.is_some()));
        assert_eq!(
            op.failure_reason,
            Some(FailureReason::MethodsExhausted { attempts: 3 })
        );
        assert_eq!(cleaner.stats().failed, 1);
    }

    #[tokio::test]
    async fn safety_check_short_circuits_without_signals() {
        let table = Arc::new(InMemoryProcessTable::with_processes([live(61_041, "node")]));
        let cleaner =
            ProcessCleaner::new(config(vec![CleanupMethod::Terminate]), table.clone()).unwrap();

        // 61_040 is gone, 61_041 now belongs to a different program
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_040, "claude"), CleanupPriority::High);
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(61_041, "claude"), CleanupPriority::High);
        wait_for_completion(&cleaner, 2).await;

        for op in cleaner.get_completed_cleanups(None) {
            assert_eq!(op.status, CleanupStatus::Failed);
            assert!(op.method_history.is_empty());
            assert!(matches!(
                op.failure_reason,
                Some(FailureReason::SafetyCheckFailed { .. })
            ));
        }
        assert!(table.signals_sent().is_empty());
    }

    #[tokio::test]
    async fn protected_pids_are_refused() {
        let table = Arc::new(InMemoryProcessTable::with_processes([ProcessSample::new(
            1,
            0,
            "init",
            ProcessStatus::Sleeping,
        )]));
        let cleaner =
            ProcessCleaner::new(config(vec![CleanupMethod::Kill]), table.clone()).unwrap();
        cleaner.queue_zombie_for_cleanup(&fixtures::zombie(1, "init"), CleanupPriority::Critical);
        wait_for_completion(&cleaner, 1).await;
        assert_eq!(cleaner.get_completed_cleanups(None)[0].status, CleanupStatus::Failed);
        assert!(table.signals_sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_limit_bounds_active_operations() {
        let pids: Vec<u32> = (61_100..61_105).collect();
        let table = Arc::new(InMemoryProcessTable::with_processes(
            pids.iter().map(|pid| live(*pid, "helper")),
        ));
        table.set_latency(Duration::from_millis(50));
        let mut cfg = config(vec![CleanupMethod::Terminate]);
        cfg.parallel_cleanup_limit = 2;
        let cleaner = ProcessCleaner::new(cfg, table.clone()).unwrap();

        for pid in &pids {
            cleaner.queue_zombie_for_cleanup(&fixtures::zombie(*pid, "helper"), CleanupPriority::Medium);
            assert!(cleaner.get_active_cleanups().len() <= 2);
        }
        timeout(Duration::from_secs(10), async {
            while cleaner.get_completed_cleanups(None).len() < pids.len() {
                assert!(cleaner.get_active_cleanups().len() <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cleanups should complete");

        assert!(table.peak_concurrent_signals() <= 2);
        assert_eq!(cleaner.stats().succeeded, 5);
    }

    #[tokio::test]
    async fn notify_parent_needs_a_real_parent() {
        let table = Arc::new(InMemoryProcessTable::with_processes([
            ProcessSample::new(61_200, 1, "orphan", ProcessStatus::Zombie),
            ProcessSample::new(61_201, 61_202, "child", ProcessStatus::Zombie),
            ProcessSample::new(61_202, 1, "parent", ProcessStatus::Sleeping),
        ]));
        let cleaner =
            ProcessCleaner::new(config(vec![CleanupMethod::NotifyParent]), table.clone()).unwrap();

        assert!(cleaner
            .execute_cleanup_method(61_200, CleanupMethod::NotifyParent)
            .await
            .is_err());
        cleaner
            .execute_cleanup_method(61_201, CleanupMethod::NotifyParent)
            .await
            .unwrap();
        assert_eq!(table.signals_sent(), vec![(61_202, ReapSignal::Child)]);
    }

    #[tokio::test]
    async fn force_cleanup_collects_reapable_zombies() {
        let table = Arc::new(InMemoryProcessTable::with_processes([live(61_300, "child")]));
        let cleaner =
            ProcessCleaner::new(config(vec![CleanupMethod::ForceCleanup]), table.clone()).unwrap();
        assert!(cleaner
            .execute_cleanup_method(61_300, CleanupMethod::ForceCleanup)
            .await
            .is_err());

        table.allow_reap(61_300);
        cleaner
            .execute_cleanup_method(61_300, CleanupMethod::ForceCleanup)
            .await
            .unwrap();
        assert!(!table.contains(61_300));
        assert!(cleaner
            .execute_cleanup_method(61_300, CleanupMethod::LivenessPoll)
            .await
            .is_ok());
    }
}
