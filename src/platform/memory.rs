//! In-memory process table
//!
//! Implements both platform traits over a mutable table. Used by tests and by
//! embedders that feed the pipeline from their own process inventory. Failures,
//! latency and process exits can be scripted per pid and signal.

use crate::core::models::{ProcessSample, ProcessStatus};
use crate::error::{errors, ReaperResult};
use crate::platform::{ProcessController, ProcessEnumerator, ProcessProbe, ReapSignal};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct TableState {
    processes: BTreeMap<u32, ProcessSample>,
    enumeration_failure: Option<String>,
    failing_signals: HashSet<(u32, ReapSignal)>,
    exits_on_signal: HashSet<(u32, ReapSignal)>,
    reapable: HashSet<u32>,
    signal_log: Vec<(u32, ReapSignal)>,
    latency: Duration,
}

#[derive(Debug, Default)]
pub struct InMemoryProcessTable {
    state: Mutex<TableState>,
    enumerations: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processes(samples: impl IntoIterator<Item = ProcessSample>) -> Self {
        let table = Self::new();
        for sample in samples {
            table.insert(sample);
        }
        table
    }

    pub fn insert(&self, sample: ProcessSample) {
        self.state.lock().processes.insert(sample.pid, sample);
    }

    pub fn remove(&self, pid: u32) -> Option<ProcessSample> {
        self.state.lock().processes.remove(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.state.lock().processes.contains_key(&pid)
    }

    /// Make every enumeration fail until cleared with `None`
    pub fn set_enumeration_failure(&self, message: Option<&str>) {
        self.state.lock().enumeration_failure = message.map(str::to_string);
    }

    /// Delay applied to enumeration and signal delivery
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn fail_signal(&self, pid: u32, signal: ReapSignal) {
        self.state.lock().failing_signals.insert((pid, signal));
    }

    /// Remove `pid` from the table once `signal` is delivered to it
    pub fn exit_on_signal(&self, pid: u32, signal: ReapSignal) {
        self.state.lock().exits_on_signal.insert((pid, signal));
    }

    pub fn allow_reap(&self, pid: u32) {
        self.state.lock().reapable.insert(pid);
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn signals_sent(&self) -> Vec<(u32, ReapSignal)> {
        self.state.lock().signal_log.clone()
    }

    /// Highest number of signal deliveries observed running at once
    pub fn peak_concurrent_signals(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

impl ProcessEnumerator for InMemoryProcessTable {
    fn enumerate(&self) -> ReaperResult<Vec<ProcessSample>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let state = self.state.lock();
        if let Some(message) = &state.enumeration_failure {
            return Err(errors::introspection_error(message.clone()));
        }
        Ok(state.processes.values().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

impl ProcessController for InMemoryProcessTable {
    fn probe(&self, pid: u32) -> ReaperResult<Option<ProcessProbe>> {
        Ok(self
            .state
            .lock()
            .processes
            .get(&pid)
            .map(|sample| ProcessProbe {
                pid: sample.pid,
                ppid: sample.ppid,
                name: sample.name.clone(),
                status: sample.status,
            }))
    }

    fn send_signal(&self, pid: u32, signal: ReapSignal) -> ReaperResult<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let result = {
            let mut state = self.state.lock();
            state.signal_log.push((pid, signal));
            if state.failing_signals.contains(&(pid, signal)) {
                Err(errors::method_error(pid, signal.to_string(), "delivery refused"))
            } else if !state.processes.contains_key(&pid) {
                Err(errors::method_error(pid, signal.to_string(), "no such process"))
            } else {
                if state.exits_on_signal.contains(&(pid, signal)) {
                    state.processes.remove(&pid);
                }
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn reap(&self, pid: u32) -> ReaperResult<bool> {
        let mut state = self.state.lock();
        if !state.reapable.contains(&pid) {
            return Err(errors::method_error(
                pid,
                "force_cleanup",
                "process is not a child of the reaper",
            ));
        }
        let collected = state
            .processes
            .get(&pid)
            .map(|sample| sample.status == ProcessStatus::Zombie)
            .unwrap_or(false);
        if collected {
            state.processes.remove(&pid);
        }
        Ok(collected)
    }
}
