//! AIW Reaper Library
//!
//! Discovers and reclaims defunct processes leaked by subprocess-heavy tooling.
//! A [`monitor::ProcessMonitor`] snapshots the process table, a
//! [`detector::ZombieDetector`] scores each process with a weighted ensemble of
//! heuristics, and a [`cleaner::ProcessCleaner`] drives confirmed zombies
//! through escalating reclamation methods. [`supervisor::ReaperSupervisor`]
//! wires the three together.

pub mod cleaner;
pub mod config;
pub mod core;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod report;
pub mod signal;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types for convenience
pub use cleaner::ProcessCleaner;
pub use config::ReaperConfig;
pub use core::events::{CleanerEvent, DetectorEvent, MonitorEvent};
pub use core::models::*;
pub use core::scan_gate::ScanOutcome;
pub use detector::ZombieDetector;
pub use error::{ReaperError, ReaperResult};
pub use monitor::ProcessMonitor;
pub use platform::{InMemoryProcessTable, ProcessController, ProcessEnumerator, ReapSignal};
pub use supervisor::ReaperSupervisor;
