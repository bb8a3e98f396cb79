//! Detection heuristics and the confidence ensemble
//!
//! Each heuristic maps a process snapshot to a confidence in `[0, 1]` plus
//! whether its positive signal fired. The ensemble renormalizes weights over
//! whichever subset is enabled.

use crate::core::models::{DetectionMethod, ImpactLevel, MethodResult, ProcessInfo, ProcessStatus};
use crate::error::{errors, ReaperResult};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// CPU usage (percent) below which a process counts as idle
pub const IDLE_CPU_PERCENT: f64 = 0.1;
/// Memory share (percent) above which an idle process looks like a leak
pub const LEAK_MEMORY_PERCENT: f64 = 10.0;

pub const MEDIUM_MEMORY_BYTES: u64 = 100 * 1024 * 1024;
pub const HIGH_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

const STATUS_ZOMBIE: f64 = 1.0;
const PARENT_MISSING: f64 = 0.8;
const LEAK_SUSPECTED: f64 = 0.6;
const LEAK_BASELINE: f64 = 0.1;
const STALE_IDLE: f64 = 0.7;
const ACTIVE_BASELINE: f64 = 0.2;

/// Observation context shared by every heuristic in one analysis pass
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext {
    pub now: DateTime<Utc>,
    /// Last moment the pid was seen doing work, or its start time
    pub idle_since: DateTime<Utc>,
    pub staleness_threshold: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Signal {
    confidence: f64,
    fired: bool,
}

impl Signal {
    fn fired(confidence: f64) -> Self {
        Self {
            confidence,
            fired: true,
        }
    }

    fn quiet(confidence: f64) -> Self {
        Self {
            confidence,
            fired: false,
        }
    }
}

/// Run one heuristic; a heuristic error degrades it to confidence 0
pub fn evaluate(
    method: DetectionMethod,
    process: &ProcessInfo,
    ctx: &AnalysisContext,
) -> MethodResult {
    let outcome = match method {
        DetectionMethod::StatusCheck => Ok(status_check(process)),
        DetectionMethod::ParentValidation => Ok(parent_validation(process)),
        DetectionMethod::ResourceLeakAnalysis => resource_leak_analysis(process),
        DetectionMethod::BehavioralAnalysis => behavioral_analysis(process, ctx),
    };

    match outcome {
        Ok(signal) => MethodResult {
            method,
            confidence: signal.confidence,
            weight: method.default_weight(),
            fired: signal.fired,
            error: None,
        },
        Err(err) => MethodResult {
            method,
            confidence: 0.0,
            weight: method.default_weight(),
            fired: false,
            error: Some(err.to_string()),
        },
    }
}

fn status_check(process: &ProcessInfo) -> Signal {
    if process.status == ProcessStatus::Zombie {
        Signal::fired(STATUS_ZOMBIE)
    } else {
        Signal::quiet(0.0)
    }
}

fn parent_validation(process: &ProcessInfo) -> Signal {
    if process.parent_exists {
        Signal::quiet(0.0)
    } else {
        Signal::fired(PARENT_MISSING)
    }
}

fn resource_leak_analysis(process: &ProcessInfo) -> ReaperResult<Signal> {
    require_finite(process, DetectionMethod::ResourceLeakAnalysis)?;
    if process.memory_percent > LEAK_MEMORY_PERCENT && process.cpu_usage < IDLE_CPU_PERCENT {
        Ok(Signal::fired(LEAK_SUSPECTED))
    } else {
        Ok(Signal::quiet(LEAK_BASELINE))
    }
}

fn behavioral_analysis(process: &ProcessInfo, ctx: &AnalysisContext) -> ReaperResult<Signal> {
    require_finite(process, DetectionMethod::BehavioralAnalysis)?;
    let idle_for = ctx
        .now
        .signed_duration_since(ctx.idle_since)
        .to_std()
        .unwrap_or_default();
    if process.cpu_usage < IDLE_CPU_PERCENT && idle_for > ctx.staleness_threshold {
        Ok(Signal::fired(STALE_IDLE))
    } else {
        Ok(Signal::quiet(ACTIVE_BASELINE))
    }
}

fn require_finite(process: &ProcessInfo, method: DetectionMethod) -> ReaperResult<()> {
    if process.cpu_usage.is_finite() && process.memory_percent.is_finite() {
        Ok(())
    } else {
        Err(errors::analysis_error(
            process.pid,
            method.as_str(),
            format!(
                "non-finite metrics (cpu={}, mem%={})",
                process.cpu_usage, process.memory_percent
            ),
        ))
    }
}

/// Weighted mean over the enabled methods, clamped to `[0, 1]`
pub fn ensemble_confidence(results: &[MethodResult]) -> f64 {
    let total_weight: f64 = results.iter().map(|r| r.weight).sum();
    if total_weight <= 0.0 || !total_weight.is_finite() {
        return 0.0;
    }
    let weighted: f64 = results.iter().map(|r| r.weight * r.confidence).sum();
    (weighted / total_weight).clamp(0.0, 1.0)
}

pub fn resource_impact(memory_bytes: u64) -> ImpactLevel {
    if memory_bytes >= HIGH_MEMORY_BYTES {
        ImpactLevel::High
    } else if memory_bytes >= MEDIUM_MEMORY_BYTES {
        ImpactLevel::Medium
    } else {
        ImpactLevel::Low
    }
}

/// Mean confidence of the methods that fired
pub fn system_impact(results: &[MethodResult]) -> ImpactLevel {
    let fired: Vec<f64> = results
        .iter()
        .filter(|r| r.fired)
        .map(|r| r.confidence)
        .collect();
    if fired.is_empty() {
        return ImpactLevel::Low;
    }
    let mean = fired.iter().sum::<f64>() / fired.len() as f64;
    if mean >= 0.9 {
        ImpactLevel::High
    } else if mean >= 0.7 {
        ImpactLevel::Medium
    } else {
        ImpactLevel::Low
    }
}
