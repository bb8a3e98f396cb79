//! Platform process capabilities
//!
//! Enumeration and control of OS processes sit behind two traits so the
//! monitor, detector and cleaner stay platform-agnostic. Both traits are
//! blocking; callers run them on the blocking thread pool.
//!
//! Platform strategy:
//! - Linux/macOS: `ps` for enumeration, signals via nix, psutil for probes on Linux
//! - Windows: sysinfo for enumeration, probes and termination

pub mod memory;
pub mod ps_format;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use crate::core::models::{ProcessSample, ProcessStatus};
use crate::error::ReaperResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use memory::InMemoryProcessTable;

/// Signals the cleaner may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapSignal {
    /// SIGTERM / graceful termination
    Terminate,
    /// SIGKILL / forced termination
    Kill,
    /// SIGCHLD to a parent, prompting it to collect exited children
    Child,
}

impl fmt::Display for ReapSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReapSignal::Terminate => "SIGTERM",
            ReapSignal::Kill => "SIGKILL",
            ReapSignal::Child => "SIGCHLD",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a single pid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessProbe {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub status: ProcessStatus,
}

/// Lists every process visible to the reaper
pub trait ProcessEnumerator: Send + Sync {
    fn enumerate(&self) -> ReaperResult<Vec<ProcessSample>>;

    fn name(&self) -> &'static str;
}

/// Inspects and signals individual processes
pub trait ProcessController: Send + Sync {
    /// `Ok(None)` when the pid no longer exists
    fn probe(&self, pid: u32) -> ReaperResult<Option<ProcessProbe>>;

    /// Succeeds when the signal was delivered, not when the target exited
    fn send_signal(&self, pid: u32, signal: ReapSignal) -> ReaperResult<()>;

    /// Non-blocking reap; `Ok(true)` when an exit status was collected
    fn reap(&self, pid: u32) -> ReaperResult<bool>;
}

/// Pids the cleaner must never act on: the kernel, init, the reaper and its parent
pub fn is_protected_pid(pid: u32) -> bool {
    if pid <= 1 {
        return true;
    }
    let own = std::process::id();
    pid == own || parent_of_current() == Some(pid)
}

#[cfg(unix)]
fn parent_of_current() -> Option<u32> {
    u32::try_from(nix::unistd::getppid().as_raw()).ok()
}

#[cfg(not(unix))]
fn parent_of_current() -> Option<u32> {
    None
}

#[cfg(unix)]
pub fn default_enumerator() -> Arc<dyn ProcessEnumerator> {
    Arc::new(unix::PsEnumerator::new())
}

#[cfg(unix)]
pub fn default_controller() -> Arc<dyn ProcessController> {
    Arc::new(unix::UnixController::new())
}

#[cfg(windows)]
pub fn default_enumerator() -> Arc<dyn ProcessEnumerator> {
    Arc::new(windows::SysinfoEnumerator::new())
}

#[cfg(windows)]
pub fn default_controller() -> Arc<dyn ProcessController> {
    Arc::new(windows::SysinfoController::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_init_and_self_are_protected() {
        assert!(is_protected_pid(0));
        assert!(is_protected_pid(1));
        assert!(is_protected_pid(std::process::id()));
    }

    #[test]
    fn signal_names_match_posix() {
        assert_eq!(ReapSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(ReapSignal::Kill.to_string(), "SIGKILL");
        assert_eq!(ReapSignal::Child.to_string(), "SIGCHLD");
    }
}
