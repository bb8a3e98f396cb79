//! 统一数据模型定义
//!
//! Process snapshots, zombie candidates and cleanup operations shared by the
//! monitor, detector and cleaner. Status fields are closed enums; the cleanup
//! operation owns its own state machine.

use crate::error::{ReaperError, ReaperResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Normalized process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Zombie,
    Stopped,
    Unknown,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::Zombie => "zombie",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One platform-normalized row of the process table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub status: ProcessStatus,
    /// 进程已运行时间（秒）
    pub elapsed_secs: u64,
    /// CPU 使用率（百分比）
    pub cpu_usage: f64,
    /// 常驻内存（字节）
    pub memory_bytes: u64,
    /// 内存占比（百分比）
    pub memory_percent: f64,
}

impl ProcessSample {
    pub fn new(pid: u32, ppid: u32, name: impl Into<String>, status: ProcessStatus) -> Self {
        Self {
            pid,
            ppid,
            name: name.into(),
            status,
            elapsed_secs: 0,
            cpu_usage: 0.0,
            memory_bytes: 0,
            memory_percent: 0.0,
        }
    }

    pub fn with_elapsed_secs(mut self, secs: u64) -> Self {
        self.elapsed_secs = secs;
        self
    }

    pub fn with_cpu_usage(mut self, cpu: f64) -> Self {
        self.cpu_usage = cpu;
        self
    }

    pub fn with_memory(mut self, bytes: u64, percent: f64) -> Self {
        self.memory_bytes = bytes;
        self.memory_percent = percent;
        self
    }
}

/// 进程快照，每个扫描周期重新创建
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub memory_percent: f64,
    /// Native zombie state, or a process whose parent is gone
    pub is_zombie: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zombie_since: Option<DateTime<Utc>>,
    pub parent_exists: bool,
    pub scan_timestamp: DateTime<Utc>,
}

impl ProcessInfo {
    /// Build a snapshot record from a platform sample taken at `scanned_at`
    pub fn from_sample(
        sample: &ProcessSample,
        parent_exists: bool,
        scanned_at: DateTime<Utc>,
    ) -> Self {
        let elapsed = i64::try_from(sample.elapsed_secs).unwrap_or(i64::MAX);
        let start_time = scanned_at
            .checked_sub_signed(Duration::seconds(elapsed))
            .unwrap_or(scanned_at);
        let is_zombie = sample.status == ProcessStatus::Zombie || !parent_exists;
        Self {
            pid: sample.pid,
            ppid: sample.ppid,
            name: sample.name.clone(),
            status: sample.status,
            start_time,
            elapsed_secs: sample.elapsed_secs,
            cpu_usage: sample.cpu_usage,
            memory_usage: sample.memory_bytes,
            memory_percent: sample.memory_percent,
            is_zombie,
            zombie_since: is_zombie.then_some(scanned_at),
            parent_exists,
            scan_timestamp: scanned_at,
        }
    }

    /// 校验快照数据完整性
    pub fn validate(&self) -> ReaperResult<()> {
        if self.pid == 0 {
            return Err(validation_error(
                "process.pid",
                "pid must be a non-zero value",
            ));
        }
        if self.ppid == self.pid {
            return Err(validation_error(
                "process.ppid",
                format!("pid {} lists itself as parent", self.pid),
            ));
        }
        Ok(())
    }
}

/// Heuristics that feed the confidence ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    StatusCheck,
    ParentValidation,
    ResourceLeakAnalysis,
    BehavioralAnalysis,
}

impl DetectionMethod {
    pub const ALL: [DetectionMethod; 4] = [
        DetectionMethod::StatusCheck,
        DetectionMethod::ParentValidation,
        DetectionMethod::ResourceLeakAnalysis,
        DetectionMethod::BehavioralAnalysis,
    ];

    pub fn default_weight(&self) -> f64 {
        match self {
            DetectionMethod::StatusCheck => 0.4,
            DetectionMethod::ParentValidation => 0.3,
            DetectionMethod::ResourceLeakAnalysis => 0.2,
            DetectionMethod::BehavioralAnalysis => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::StatusCheck => "status_check",
            DetectionMethod::ParentValidation => "parent_validation",
            DetectionMethod::ResourceLeakAnalysis => "resource_leak_analysis",
            DetectionMethod::BehavioralAnalysis => "behavioral_analysis",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-result of a single heuristic for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodResult {
    pub method: DetectionMethod,
    pub confidence: f64,
    pub weight: f64,
    /// Whether the heuristic's positive signal was observed
    pub fired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cleanup progress as seen from the detector's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZombieCleanupStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Ignored,
}

impl ZombieCleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZombieCleanupStatus::Pending => "pending",
            ZombieCleanupStatus::InProgress => "in_progress",
            ZombieCleanupStatus::Success => "success",
            ZombieCleanupStatus::Failed => "failed",
            ZombieCleanupStatus::Ignored => "ignored",
        }
    }
}

/// 已确认的僵尸进程候选
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZombieProcessInfo {
    #[serde(flatten)]
    pub process: ProcessInfo,
    pub zombie_confidence: f64,
    /// Methods whose positive signal fired
    pub detection_methods: Vec<DetectionMethod>,
    pub method_results: Vec<MethodResult>,
    pub first_detected: DateTime<Utc>,
    pub last_confirmed: DateTime<Utc>,
    pub zombie_lifetime_secs: i64,
    pub cleanup_attempts: u32,
    pub cleanup_status: ZombieCleanupStatus,
    pub resource_impact: ImpactLevel,
    pub system_impact: ImpactLevel,
}

impl ZombieProcessInfo {
    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    /// Carry the history of an earlier detection of the same pid forward
    pub fn inherit_from(&mut self, previous: &ZombieProcessInfo) {
        if previous.first_detected < self.first_detected {
            self.first_detected = previous.first_detected;
        }
        self.cleanup_attempts = previous.cleanup_attempts;
        self.cleanup_status = previous.cleanup_status;
        self.refresh_lifetime();
    }

    pub fn refresh_lifetime(&mut self) {
        self.zombie_lifetime_secs = self
            .last_confirmed
            .signed_duration_since(self.first_detected)
            .num_seconds()
            .max(0);
    }
}

/// Priority tier for queued cleanup work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl CleanupPriority {
    /// Highest tier first
    pub const DEQUEUE_ORDER: [CleanupPriority; 4] = [
        CleanupPriority::Critical,
        CleanupPriority::High,
        CleanupPriority::Medium,
        CleanupPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPriority::Low => "low",
            CleanupPriority::Medium => "medium",
            CleanupPriority::High => "high",
            CleanupPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for CleanupPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reclamation methods, listed from least to most aggressive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMethod {
    LivenessPoll,
    Terminate,
    Kill,
    NotifyParent,
    ForceCleanup,
}

impl CleanupMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMethod::LivenessPoll => "liveness_poll",
            CleanupMethod::Terminate => "terminate",
            CleanupMethod::Kill => "kill",
            CleanupMethod::NotifyParent => "notify_parent",
            CleanupMethod::ForceCleanup => "force_cleanup",
        }
    }
}

impl fmt::Display for CleanupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    Pending,
    InProgress,
    Retry,
    Success,
    Failed,
}

impl CleanupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CleanupStatus::Success | CleanupStatus::Failed)
    }

    pub fn can_transition_to(&self, next: CleanupStatus) -> bool {
        use CleanupStatus::*;
        match (*self, next) {
            (Pending, InProgress) => true,
            (InProgress, Retry) | (InProgress, Success) | (InProgress, Failed) => true,
            (Retry, InProgress) | (Retry, Failed) => true,
            (Pending, _) | (InProgress, _) | (Retry, _) => false,
            (Success, _) | (Failed, _) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStatus::Pending => "pending",
            CleanupStatus::InProgress => "in_progress",
            CleanupStatus::Retry => "retry",
            CleanupStatus::Success => "success",
            CleanupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    SafetyCheckFailed { reason: String },
    MethodsExhausted { attempts: u32 },
}

/// 单次清理方法执行记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupMethodAttempt {
    pub method: CleanupMethod,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub resources_freed: u64,
}

/// 清理操作及其完整审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOperation {
    pub operation_id: String,
    pub pid: u32,
    pub ppid: u32,
    pub process_name: String,
    /// Resident memory at detection time, credited when the process goes away
    pub memory_usage: u64,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub status: CleanupStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_method: Option<CleanupMethod>,
    pub method_history: Vec<CleanupMethodAttempt>,
    pub resources_freed: u64,
    pub source: String,
    pub priority: CleanupPriority,
    pub initiated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl CleanupOperation {
    pub fn new(
        zombie: &ZombieProcessInfo,
        priority: CleanupPriority,
        source: impl Into<String>,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            pid: zombie.process.pid,
            ppid: zombie.process.ppid,
            process_name: zombie.process.name.clone(),
            memory_usage: zombie.process.memory_usage,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            status: CleanupStatus::Pending,
            attempts: 0,
            current_method: None,
            method_history: Vec::new(),
            resources_freed: 0,
            source: source.into(),
            priority,
            initiated_by: initiated_by.into(),
            failure_reason: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: CleanupStatus) -> ReaperResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ReaperError::InvalidTransition {
                operation_id: self.operation_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == CleanupStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn record_attempt(&mut self, attempt: CleanupMethodAttempt) {
        self.resources_freed = self.resources_freed.saturating_add(attempt.resources_freed);
        self.method_history.push(attempt);
        self.attempts = self.method_history.len() as u32;
    }

    /// Set the terminal status exactly once
    pub fn finish(
        &mut self,
        status: CleanupStatus,
        failure_reason: Option<FailureReason>,
    ) -> ReaperResult<()> {
        self.transition(status)?;
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.duration_ms = self
            .started_at
            .map(|started| ended_at.signed_duration_since(started).num_milliseconds());
        self.current_method = None;
        self.failure_reason = failure_reason;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn validation_error(field: &str, message: impl Into<String>) -> ReaperError {
    ReaperError::Validation {
        message: message.into(),
        field: Some(field.to_string()),
        value: None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn zombie(pid: u32, name: &str) -> ZombieProcessInfo {
        let now = Utc::now();
        let sample = ProcessSample::new(pid, 1, name, ProcessStatus::Zombie)
            .with_memory(256 * 1024 * 1024, 1.5);
        ZombieProcessInfo {
            process: ProcessInfo::from_sample(&sample, false, now),
            zombie_confidence: 0.9,
            detection_methods: vec![DetectionMethod::StatusCheck],
            method_results: Vec::new(),
            first_detected: now,
            last_confirmed: now,
            zombie_lifetime_secs: 0,
            cleanup_attempts: 0,
            cleanup_status: ZombieCleanupStatus::Pending,
            resource_impact: ImpactLevel::Medium,
            system_impact: ImpactLevel::High,
        }
    }
}
