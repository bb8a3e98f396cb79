//! Single in-flight guard for scan loops
//!
//! At most one scan runs at a time. A second caller gets `None` immediately
//! instead of waiting, so slow introspection never piles up queued work.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Result of one gated scan or analysis pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Finished; carries the number of records produced
    Completed(usize),
    /// Another pass was already in flight
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct ScanGate {
    state: Mutex<ScanState>,
}

impl ScanGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScanState::Idle),
        }
    }

    /// Enter the scanning state, or `None` if a scan is already in flight
    pub fn try_enter(&self) -> Option<ScanPermit<'_>> {
        let mut state = self.state.lock();
        match *state {
            ScanState::Scanning => None,
            ScanState::Idle => {
                *state = ScanState::Scanning;
                Some(ScanPermit { gate: self })
            }
        }
    }

    /// Like [`ScanGate::try_enter`], but the permit can outlive the borrow
    ///
    /// Used when the scan work may keep running after its caller gave up on it.
    pub fn try_enter_owned(self: &Arc<Self>) -> Option<OwnedScanPermit> {
        let mut state = self.state.lock();
        match *state {
            ScanState::Scanning => None,
            ScanState::Idle => {
                *state = ScanState::Scanning;
                Some(OwnedScanPermit {
                    gate: Arc::clone(self),
                })
            }
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    fn release(&self) {
        *self.state.lock() = ScanState::Idle;
    }
}

impl Default for ScanGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the gate to `Idle` when dropped, including on early return
pub struct ScanPermit<'a> {
    gate: &'a ScanGate,
}

impl Drop for ScanPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Owned form of [`ScanPermit`]
pub struct OwnedScanPermit {
    gate: Arc<ScanGate>,
}

impl Drop for OwnedScanPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_while_scanning() {
        let gate = ScanGate::new();
        let permit = gate.try_enter();
        assert!(permit.is_some());
        assert_eq!(gate.state(), ScanState::Scanning);
        assert!(gate.try_enter().is_none());

        drop(permit);
        assert_eq!(gate.state(), ScanState::Idle);
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn owned_permit_holds_the_gate_until_dropped() {
        let gate = Arc::new(ScanGate::new());
        let permit = gate.try_enter_owned().unwrap();
        assert!(gate.try_enter().is_none());
        assert!(gate.try_enter_owned().is_none());

        let handle = std::thread::spawn(move || drop(permit));
        handle.join().unwrap();
        assert_eq!(gate.state(), ScanState::Idle);
    }
}
