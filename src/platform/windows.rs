use crate::core::models::{ProcessSample, ProcessStatus};
use crate::error::{errors, ReaperResult};
use crate::platform::{ProcessController, ProcessEnumerator, ProcessProbe, ReapSignal};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus as SysStatus, ProcessesToUpdate, Signal, System};

fn map_status(status: SysStatus) -> ProcessStatus {
    match status {
        SysStatus::Run => ProcessStatus::Running,
        SysStatus::Sleep | SysStatus::Idle => ProcessStatus::Sleeping,
        SysStatus::Zombie => ProcessStatus::Zombie,
        SysStatus::Stop => ProcessStatus::Stopped,
        _ => ProcessStatus::Unknown,
    }
}

/// Enumerates processes from a long-lived sysinfo snapshot
#[derive(Debug)]
pub struct SysinfoEnumerator {
    system: Mutex<System>,
}

impl SysinfoEnumerator {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEnumerator for SysinfoEnumerator {
    fn enumerate(&self) -> ReaperResult<Vec<ProcessSample>> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let total_memory = system.total_memory();
        let samples = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != 0)
            .map(|(pid, process)| {
                let memory = process.memory();
                let memory_percent = if total_memory > 0 {
                    memory as f64 / total_memory as f64 * 100.0
                } else {
                    0.0
                };
                ProcessSample::new(
                    pid.as_u32(),
                    process.parent().map(|p| p.as_u32()).unwrap_or(0),
                    process.name().to_string_lossy().into_owned(),
                    map_status(process.status()),
                )
                .with_elapsed_secs(process.run_time())
                .with_cpu_usage(f64::from(process.cpu_usage()))
                .with_memory(memory, memory_percent)
            })
            .collect();
        Ok(samples)
    }

    fn name(&self) -> &'static str {
        "sysinfo"
    }
}

/// Process control through sysinfo's termination API
#[derive(Debug)]
pub struct SysinfoController {
    system: Mutex<System>,
}

impl SysinfoController {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController for SysinfoController {
    fn probe(&self, pid: u32) -> ReaperResult<Option<ProcessProbe>> {
        let mut system = self.system.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        Ok(system.process(sys_pid).map(|process| ProcessProbe {
            pid,
            ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
            name: process.name().to_string_lossy().into_owned(),
            status: map_status(process.status()),
        }))
    }

    fn send_signal(&self, pid: u32, signal: ReapSignal) -> ReaperResult<()> {
        let mut system = self.system.lock();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let process = system
            .process(sys_pid)
            .ok_or_else(|| errors::method_error(pid, signal.to_string(), "process not found"))?;

        let delivered = match signal {
            ReapSignal::Terminate => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            ReapSignal::Kill => process.kill(),
            ReapSignal::Child => {
                return Err(errors::method_error(
                    pid,
                    signal.to_string(),
                    "parent notification is not supported on Windows",
                ))
            }
        };

        if delivered {
            Ok(())
        } else {
            Err(errors::method_error(
                pid,
                signal.to_string(),
                "termination request was rejected",
            ))
        }
    }

    fn reap(&self, pid: u32) -> ReaperResult<bool> {
        Err(errors::method_error(
            pid,
            "force_cleanup",
            "exit status collection is not supported on Windows",
        ))
    }
}
