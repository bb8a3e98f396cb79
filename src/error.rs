//! Unified error handling for the reaper
//!
//! Every failure the pipeline can hit is classified here. Components recover
//! locally and surface these values through their event ports; only
//! construction-time misconfiguration is returned to the caller.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for the reaper
#[derive(Error, Debug)]
pub enum ReaperError {
    /// Process-table query failed (transient, the previous snapshot is kept)
    #[error("Process introspection failed: {message}")]
    Introspection {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single detection heuristic could not produce a confidence
    #[error("Detection method {method} failed for pid {pid}: {message}")]
    Analysis {
        pid: u32,
        method: String,
        message: String,
    },

    /// Pre-action re-check refused to touch the process
    #[error("Safety check refused pid {pid}: {reason}")]
    SafetyCheck { pid: u32, reason: String },

    /// A reclamation method failed or signal delivery was rejected
    #[error("Cleanup method {method} failed for pid {pid}: {message}")]
    MethodExecution {
        pid: u32,
        method: String,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Every configured reclamation method failed
    #[error("All {attempts} cleanup attempts failed for pid {pid}")]
    Exhausted { pid: u32, attempts: u32 },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        value: Option<String>,
    },

    /// Illegal cleanup state machine transition
    #[error("Invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: String,
        from: String,
        to: String,
    },

    /// Timeout errors
    #[error("Timeout error: {message} (timeout: {timeout_ms}ms)")]
    Timeout { message: String, timeout_ms: u64 },

    /// Runtime / task infrastructure errors
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Filesystem errors
    #[error("Filesystem error: {message} (path: {path})")]
    Filesystem {
        message: String,
        path: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ReaperError {
    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReaperError::Introspection { .. } => ErrorCategory::Introspection,
            ReaperError::Analysis { .. } => ErrorCategory::Analysis,
            ReaperError::SafetyCheck { .. } => ErrorCategory::Safety,
            ReaperError::MethodExecution { .. } => ErrorCategory::Cleanup,
            ReaperError::Exhausted { .. } => ErrorCategory::Cleanup,
            ReaperError::Config { .. } => ErrorCategory::Config,
            ReaperError::Validation { .. } => ErrorCategory::Validation,
            ReaperError::InvalidTransition { .. } => ErrorCategory::Validation,
            ReaperError::Timeout { .. } => ErrorCategory::Timeout,
            ReaperError::Runtime { .. } => ErrorCategory::Runtime,
            ReaperError::Filesystem { .. } => ErrorCategory::Filesystem,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ReaperError::Introspection { .. } => ErrorSeverity::Medium,
            ReaperError::Analysis { .. } => ErrorSeverity::Low,
            ReaperError::SafetyCheck { .. } => ErrorSeverity::Medium,
            ReaperError::MethodExecution { .. } => ErrorSeverity::Low,
            ReaperError::Exhausted { .. } => ErrorSeverity::Medium,
            ReaperError::Config { .. } => ErrorSeverity::High,
            ReaperError::Validation { .. } => ErrorSeverity::Low,
            ReaperError::InvalidTransition { .. } => ErrorSeverity::Critical,
            ReaperError::Timeout { .. } => ErrorSeverity::Medium,
            ReaperError::Runtime { .. } => ErrorSeverity::High,
            ReaperError::Filesystem { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if error is recoverable without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReaperError::Introspection { .. } => true,
            ReaperError::Analysis { .. } => true,
            ReaperError::SafetyCheck { .. } => true,
            ReaperError::MethodExecution { .. } => true,
            ReaperError::Exhausted { .. } => true,
            ReaperError::Config { .. } => false,
            ReaperError::Validation { .. } => true,
            ReaperError::InvalidTransition { .. } => false,
            ReaperError::Timeout { .. } => true,
            ReaperError::Runtime { .. } => false,
            ReaperError::Filesystem { .. } => false,
        }
    }

    /// Level a background component should log this error at
    pub fn log_level(&self) -> tracing::Level {
        if !self.is_recoverable() {
            return tracing::Level::ERROR;
        }
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => tracing::Level::ERROR,
            ErrorSeverity::Medium => tracing::Level::WARN,
            ErrorSeverity::Low => tracing::Level::DEBUG,
        }
    }

    /// Log at [`Self::log_level`], tagged with the reporting component
    pub fn log(&self, component: &'static str) {
        let category = self.category();
        let level = self.log_level();
        if level == tracing::Level::ERROR {
            tracing::error!(component, ?category, error = %self, "component error");
        } else if level == tracing::Level::WARN {
            tracing::warn!(component, ?category, error = %self, "component error");
        } else {
            tracing::debug!(component, ?category, error = %self, "component error");
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            ReaperError::Introspection { message, .. } => {
                format!("Could not read the process table: {}", message)
            }
            ReaperError::Analysis {
                pid,
                method,
                message,
            } => format!("Heuristic '{}' skipped pid {}: {}", method, pid, message),
            ReaperError::SafetyCheck { pid, reason } => {
                format!("Refused to clean up pid {}: {}", pid, reason)
            }
            ReaperError::MethodExecution {
                pid,
                method,
                message,
                ..
            } => format!("Cleanup step '{}' failed for pid {}: {}", method, pid, message),
            ReaperError::Exhausted { pid, attempts } => format!(
                "Gave up on pid {} after {} cleanup attempts; it will be retried on a later cycle",
                pid, attempts
            ),
            ReaperError::Config { message, .. } => {
                format!("Configuration problem: {}", message)
            }
            ReaperError::Validation { message, .. } => {
                format!("Input validation failed: {}", message)
            }
            ReaperError::InvalidTransition { from, to, .. } => {
                format!("Internal state error ({} -> {})", from, to)
            }
            ReaperError::Timeout { message, .. } => format!("Operation timed out: {}", message),
            ReaperError::Runtime { message } => format!("Runtime problem: {}", message),
            ReaperError::Filesystem { message, .. } => {
                format!("File system problem: {}", message)
            }
        }
    }
}

impl From<io::Error> for ReaperError {
    fn from(err: io::Error) -> Self {
        ReaperError::Filesystem {
            message: format!("I/O error: {err}"),
            path: "<io>".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for ReaperError {
    fn from(err: serde_json::Error) -> Self {
        ReaperError::Config {
            message: format!("invalid JSON: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Introspection,
    Analysis,
    Safety,
    Cleanup,
    Config,
    Validation,
    Timeout,
    Runtime,
    Filesystem,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Introspection => "Introspection",
            ErrorCategory::Analysis => "Analysis",
            ErrorCategory::Safety => "Safety",
            ErrorCategory::Cleanup => "Cleanup",
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Runtime => "Runtime",
            ErrorCategory::Filesystem => "Filesystem",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result type alias for convenience
pub type ReaperResult<T> = Result<T, ReaperError>;

/// Convenience functions for creating common errors
pub mod errors {
    use super::*;

    pub fn introspection_error(message: impl Into<String>) -> ReaperError {
        ReaperError::Introspection {
            message: message.into(),
            source: None,
        }
    }

    pub fn introspection_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> ReaperError {
        ReaperError::Introspection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn analysis_error(
        pid: u32,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> ReaperError {
        ReaperError::Analysis {
            pid,
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn safety_error(pid: u32, reason: impl Into<String>) -> ReaperError {
        ReaperError::SafetyCheck {
            pid,
            reason: reason.into(),
        }
    }

    pub fn method_error(
        pid: u32,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> ReaperError {
        ReaperError::MethodExecution {
            pid,
            method: method.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn method_error_with_source(
        pid: u32,
        method: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> ReaperError {
        ReaperError::MethodExecution {
            pid,
            method: method.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config_error(message: impl Into<String>) -> ReaperError {
        ReaperError::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation_error(
        message: impl Into<String>,
        field: Option<String>,
        value: Option<String>,
    ) -> ReaperError {
        ReaperError::Validation {
            message: message.into(),
            field,
            value,
        }
    }

    pub fn timeout_error(message: impl Into<String>, timeout_ms: u64) -> ReaperError {
        ReaperError::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    pub fn runtime_error(message: impl Into<String>) -> ReaperError {
        ReaperError::Runtime {
            message: message.into(),
        }
    }
}
