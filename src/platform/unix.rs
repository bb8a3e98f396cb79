use crate::core::models::{ProcessSample, ProcessStatus};
use crate::error::{errors, ReaperResult};
use crate::platform::ps_format::{self, PS_COLUMNS};
use crate::platform::{ProcessController, ProcessEnumerator, ProcessProbe, ReapSignal};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::process::Command;
use tracing::debug;

/// Enumerates the process table by shelling out to `ps`
#[derive(Debug, Default)]
pub struct PsEnumerator;

impl PsEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessEnumerator for PsEnumerator {
    fn enumerate(&self) -> ReaperResult<Vec<ProcessSample>> {
        let output = Command::new("ps")
            .args(["-A", "-o", PS_COLUMNS])
            .output()
            .map_err(|err| errors::introspection_error_with_source("failed to run ps", err))?;

        if !output.status.success() {
            return Err(errors::introspection_error(format!(
                "ps exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (samples, skipped) = ps_format::parse_ps_output(&stdout);
        if skipped > 0 {
            debug!(skipped, "skipped unparseable ps rows");
        }
        Ok(samples)
    }

    fn name(&self) -> &'static str {
        "ps"
    }
}

/// Signal delivery and probing for Unix hosts
#[derive(Debug, Default)]
pub struct UnixController;

impl UnixController {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessController for UnixController {
    fn probe(&self, pid: u32) -> ReaperResult<Option<ProcessProbe>> {
        if !process_alive(pid) {
            return Ok(None);
        }
        probe_details(pid)
    }

    fn send_signal(&self, pid: u32, reap_signal: ReapSignal) -> ReaperResult<()> {
        let target = to_nix_pid(pid)?;
        let sig = match reap_signal {
            ReapSignal::Terminate => Signal::SIGTERM,
            ReapSignal::Kill => Signal::SIGKILL,
            ReapSignal::Child => Signal::SIGCHLD,
        };
        signal::kill(target, sig).map_err(|errno| {
            errors::method_error_with_source(
                pid,
                reap_signal.to_string(),
                format!("signal delivery failed: {}", errno.desc()),
                errno,
            )
        })?;
        debug!(pid, signal = %reap_signal, "signal delivered");
        Ok(())
    }

    fn reap(&self, pid: u32) -> ReaperResult<bool> {
        let target = to_nix_pid(pid)?;
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(status) => {
                debug!(pid, ?status, "collected exit status");
                Ok(true)
            }
            Err(Errno::ECHILD) => Err(errors::method_error(
                pid,
                "force_cleanup",
                "process is not a child of the reaper",
            )),
            Err(errno) => Err(errors::method_error_with_source(
                pid,
                "force_cleanup",
                "waitpid failed",
                errno,
            )),
        }
    }
}

/// Check if process is alive
///
/// EPERM means the process exists but belongs to someone else
pub fn process_alive(pid: u32) -> bool {
    let Ok(target) = to_nix_pid(pid) else {
        return false;
    };
    match signal::kill(target, None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

fn to_nix_pid(pid: u32) -> ReaperResult<Pid> {
    let raw = i32::try_from(pid).map_err(|_| {
        errors::validation_error(
            format!("pid {pid} is out of range"),
            Some("pid".to_string()),
            Some(pid.to_string()),
        )
    })?;
    if raw <= 0 {
        return Err(errors::validation_error(
            "pid must be positive",
            Some("pid".to_string()),
            Some(pid.to_string()),
        ));
    }
    Ok(Pid::from_raw(raw))
}

/// Linux probe backed by psutil
#[cfg(target_os = "linux")]
fn probe_details(pid: u32) -> ReaperResult<Option<ProcessProbe>> {
    use psutil::process::{Process, Status};

    let process = match Process::new(pid) {
        Ok(process) => process,
        Err(err) => {
            if !process_alive(pid) {
                return Ok(None);
            }
            return Err(errors::introspection_error(format!(
                "psutil could not open pid {pid}: {err:?}"
            )));
        }
    };

    let status = match process.status() {
        Ok(Status::Running) => ProcessStatus::Running,
        Ok(Status::Sleeping) | Ok(Status::DiskSleep) | Ok(Status::Idle) => ProcessStatus::Sleeping,
        Ok(Status::Zombie) => ProcessStatus::Zombie,
        Ok(Status::Stopped) => ProcessStatus::Stopped,
        Ok(_) | Err(_) => ProcessStatus::Unknown,
    };

    Ok(Some(ProcessProbe {
        pid,
        ppid: process.ppid().ok().flatten().unwrap_or(0),
        name: process.name().unwrap_or_default(),
        status,
    }))
}

/// Non-Linux Unix probe: a single-row `ps` query
#[cfg(not(target_os = "linux"))]
fn probe_details(pid: u32) -> ReaperResult<Option<ProcessProbe>> {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", PS_COLUMNS])
        .output()
        .map_err(|err| errors::introspection_error_with_source("failed to run ps", err))?;

    // ps exits non-zero when the pid is gone
    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().find_map(ps_format::parse_ps_line).map(|sample| ProcessProbe {
        pid: sample.pid,
        ppid: sample.ppid,
        name: sample.name,
        status: sample.status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_rejected() {
        assert!(to_nix_pid(0).is_err());
        assert!(to_nix_pid(u32::MAX).is_err());
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn probe_reports_current_process() {
        let controller = UnixController::new();
        let probe = controller
            .probe(std::process::id())
            .expect("probe should succeed")
            .expect("current process should exist");
        assert_eq!(probe.pid, std::process::id());
        assert!(!probe.name.is_empty());
    }

    #[test]
    fn reaping_a_non_child_fails() {
        let controller = UnixController::new();
        assert!(controller.reap(1).is_err());
    }

    #[test]
    fn ps_enumeration_includes_current_process() {
        let samples = PsEnumerator::new().enumerate().expect("ps should run");
        assert!(samples.iter().any(|s| s.pid == std::process::id()));
    }
}
