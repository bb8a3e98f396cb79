//! Reaper configuration
//!
//! Loaded from `~/.aiw/reaper.json` when present, then overridden from the
//! environment and validated. Every key is optional and falls back to its
//! default.

use crate::core::models::{CleanupMethod, DetectionMethod};
use crate::error::{errors, ReaperError, ReaperResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const CONFIG_DIRECTORY: &str = ".aiw";
pub const CONFIG_FILE_NAME: &str = "reaper.json";

pub const SCAN_INTERVAL_ENV: &str = "AIW_REAPER_SCAN_INTERVAL_MS";
pub const ANALYSIS_INTERVAL_ENV: &str = "AIW_REAPER_ANALYSIS_INTERVAL_MS";
pub const CONFIDENCE_THRESHOLD_ENV: &str = "AIW_REAPER_CONFIDENCE_THRESHOLD";
pub const MAX_RETRIES_ENV: &str = "AIW_REAPER_MAX_RETRIES";
pub const RETRY_DELAY_ENV: &str = "AIW_REAPER_RETRY_DELAY_MS";
pub const CLEANUP_TIMEOUT_ENV: &str = "AIW_REAPER_CLEANUP_TIMEOUT_MS";
pub const PARALLEL_LIMIT_ENV: &str = "AIW_REAPER_PARALLEL_LIMIT";
pub const SAFETY_CHECKS_ENV: &str = "AIW_REAPER_SAFETY_CHECKS";

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PARALLEL_CLEANUP_LIMIT: usize = 5;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

pub const DEFAULT_CLEANUP_METHODS: [CleanupMethod; 3] = [
    CleanupMethod::LivenessPoll,
    CleanupMethod::Terminate,
    CleanupMethod::Kill,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ReaperConfig {
    pub monitor: MonitorConfig,
    pub detector: DetectorConfig,
    pub cleaner: CleanerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    pub scan_interval_ms: u64,
    /// Upper bound for one enumeration of the process table
    pub scan_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: DEFAULT_SCAN_INTERVAL.as_millis() as u64,
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl MonitorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn validate(&self) -> ReaperResult<()> {
        require_positive("monitor.scanIntervalMs", self.scan_interval_ms)?;
        require_positive("monitor.scanTimeoutMs", self.scan_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    pub analysis_interval_ms: u64,
    pub confidence_threshold: f64,
    /// Enabled heuristics; weights are renormalized over this subset
    pub detection_methods: Vec<DetectionMethod>,
    pub staleness_threshold_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: DEFAULT_ANALYSIS_INTERVAL.as_millis() as u64,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            detection_methods: DetectionMethod::ALL.to_vec(),
            staleness_threshold_secs: DEFAULT_STALENESS_THRESHOLD.as_secs(),
        }
    }
}

impl DetectorConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn validate(&self) -> ReaperResult<()> {
        require_positive("detector.analysisIntervalMs", self.analysis_interval_ms)?;
        if !self.confidence_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.confidence_threshold)
        {
            return Err(invalid(
                "detector.confidenceThreshold",
                self.confidence_threshold,
                "must be between 0 and 1",
            ));
        }
        require_unique_non_empty("detector.detectionMethods", &self.detection_methods)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanerConfig {
    /// Re-queue budget per zombie before it is marked ignored
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub cleanup_timeout_ms: u64,
    /// Escalation order
    pub cleanup_methods: Vec<CleanupMethod>,
    pub parallel_cleanup_limit: usize,
    pub safety_checks: bool,
    pub history_limit: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            cleanup_timeout_ms: DEFAULT_CLEANUP_TIMEOUT.as_millis() as u64,
            cleanup_methods: DEFAULT_CLEANUP_METHODS.to_vec(),
            parallel_cleanup_limit: DEFAULT_PARALLEL_CLEANUP_LIMIT,
            safety_checks: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl CleanerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn validate(&self) -> ReaperResult<()> {
        require_unique_non_empty("cleaner.cleanupMethods", &self.cleanup_methods)?;
        require_positive(
            "cleaner.parallelCleanupLimit",
            self.parallel_cleanup_limit as u64,
        )?;
        require_positive("cleaner.cleanupTimeoutMs", self.cleanup_timeout_ms)?;
        require_positive("cleaner.historyLimit", self.history_limit as u64)
    }
}

impl ReaperConfig {
    /// Load from `path` (or the default location), apply env overrides, validate
    pub fn load(path: Option<&Path>) -> ReaperResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|err| ReaperError::Filesystem {
                message: format!("failed to read reaper config: {err}"),
                path: path.display().to_string(),
                source: Some(Box::new(err)),
            })?;
            debug!(path = %path.display(), "loaded reaper config");
            Self::from_json_str(&content)?
        } else {
            debug!(path = %path.display(), "no reaper config found, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> ReaperResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> ReaperResult<()> {
        if let Some(value) = env_value(SCAN_INTERVAL_ENV)? {
            self.monitor.scan_interval_ms = value;
        }
        if let Some(value) = env_value(ANALYSIS_INTERVAL_ENV)? {
            self.detector.analysis_interval_ms = value;
        }
        if let Some(value) = env_value(CONFIDENCE_THRESHOLD_ENV)? {
            self.detector.confidence_threshold = value;
        }
        if let Some(value) = env_value(MAX_RETRIES_ENV)? {
            self.cleaner.max_retries = value;
        }
        if let Some(value) = env_value(RETRY_DELAY_ENV)? {
            self.cleaner.retry_delay_ms = value;
        }
        if let Some(value) = env_value(CLEANUP_TIMEOUT_ENV)? {
            self.cleaner.cleanup_timeout_ms = value;
        }
        if let Some(value) = env_value(PARALLEL_LIMIT_ENV)? {
            self.cleaner.parallel_cleanup_limit = value;
        }
        if let Ok(raw) = std::env::var(SAFETY_CHECKS_ENV) {
            self.cleaner.safety_checks = parse_flag(SAFETY_CHECKS_ENV, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ReaperResult<()> {
        self.monitor.validate()?;
        self.detector.validate()?;
        self.cleaner.validate()
    }
}

pub fn default_config_path() -> ReaperResult<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIRECTORY).join(CONFIG_FILE_NAME))
        .ok_or_else(|| errors::config_error("could not determine home directory"))
}

fn env_value<T>(key: &str) -> ReaperResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
            errors::validation_error(
                format!("{key} is not valid: {err}"),
                Some(key.to_string()),
                Some(raw),
            )
        }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(key: &str, raw: &str) -> ReaperResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(errors::validation_error(
            format!("{key} must be a boolean"),
            Some(key.to_string()),
            Some(raw.to_string()),
        )),
    }
}

fn require_positive(field: &str, value: u64) -> ReaperResult<()> {
    if value == 0 {
        return Err(invalid(field, value, "must be greater than zero"));
    }
    Ok(())
}

fn require_unique_non_empty<T>(field: &str, items: &[T]) -> ReaperResult<()>
where
    T: Copy + Eq + std::hash::Hash + std::fmt::Debug,
{
    if items.is_empty() {
        return Err(errors::config_error(format!("{field} must not be empty")));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = items.iter().find(|item| !seen.insert(**item)) {
        return Err(errors::config_error(format!(
            "{field} lists {duplicate:?} more than once"
        )));
    }
    Ok(())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ReaperError {
    errors::validation_error(
        format!("{field} {reason}"),
        Some(field.to_string()),
        Some(value.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    const ALL_ENV: [&str; 8] = [
        SCAN_INTERVAL_ENV,
        ANALYSIS_INTERVAL_ENV,
        CONFIDENCE_THRESHOLD_ENV,
        MAX_RETRIES_ENV,
        RETRY_DELAY_ENV,
        CLEANUP_TIMEOUT_ENV,
        PARALLEL_LIMIT_ENV,
        SAFETY_CHECKS_ENV,
    ];

    fn clear_env() {
        for key in ALL_ENV {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ReaperConfig::default();
        assert_eq!(config.monitor.scan_interval(), Duration::from_secs(5));
        assert_eq!(config.detector.analysis_interval(), Duration::from_secs(10));
        assert_eq!(config.detector.confidence_threshold, 0.7);
        assert_eq!(config.detector.detection_methods.len(), 4);
        assert_eq!(config.cleaner.max_retries, 3);
        assert_eq!(config.cleaner.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.cleaner.cleanup_timeout(), Duration::from_secs(30));
        assert_eq!(config.cleaner.parallel_cleanup_limit, 5);
        assert_eq!(config.cleaner.history_limit, 100);
        assert_eq!(config.cleaner.cleanup_methods, DEFAULT_CLEANUP_METHODS.to_vec());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ReaperConfig::from_json_str(
            r#"{ "detector": { "confidenceThreshold": 0.8 }, "cleaner": { "cleanupMethods": ["terminate", "kill"] } }"#,
        )
        .unwrap();
        assert_eq!(config.detector.confidence_threshold, 0.8);
        assert_eq!(config.detector.analysis_interval_ms, 10_000);
        assert_eq!(
            config.cleaner.cleanup_methods,
            vec![CleanupMethod::Terminate, CleanupMethod::Kill]
        );
        assert_eq!(config.monitor, MonitorConfig::default());
    }

    #[test]
    fn invalid_method_lists_are_rejected() {
        let mut config = CleanerConfig::default();
        config.cleanup_methods.clear();
        assert_eq!(config.validate().unwrap_err().category(), ErrorCategory::Config);

        config.cleanup_methods = vec![CleanupMethod::Kill, CleanupMethod::Kill];
        assert!(config.validate().is_err());

        let mut config = CleanerConfig::default();
        config.parallel_cleanup_limit = 0;
        assert!(config.validate().is_err());

        let mut detector = DetectorConfig::default();
        detector.confidence_threshold = 1.5;
        assert!(detector.validate().is_err());
    }

    #[test]
    #[serial]
    fn load_reads_file_and_applies_env_overrides() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{ "monitor": {{ "scanIntervalMs": 2000 }} }}"#).unwrap();

        std::env::set_var(PARALLEL_LIMIT_ENV, "2");
        std::env::set_var(SAFETY_CHECKS_ENV, "off");
        let config = ReaperConfig::load(Some(&path)).unwrap();
        clear_env();

        assert_eq!(config.monitor.scan_interval_ms, 2000);
        assert_eq!(config.cleaner.parallel_cleanup_limit, 2);
        assert!(!config.cleaner.safety_checks);
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let config = ReaperConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, ReaperConfig::default());
    }

    #[test]
    #[serial]
    fn malformed_env_values_fail_fast() {
        clear_env();
        std::env::set_var(CONFIDENCE_THRESHOLD_ENV, "very");
        let dir = tempfile::tempdir().unwrap();
        let result = ReaperConfig::load(Some(&dir.path().join("absent.json")));
        clear_env();
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Validation);
    }
}
