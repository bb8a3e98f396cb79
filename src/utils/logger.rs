//! 日志系统
//!
//! 提供统一的日志记录功能

use crate::error::{errors, ReaperResult};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认过滤规则：依赖库 info，reaper 自身 debug
pub const DEFAULT_LOG_FILTER: &str = "info,aiw_reaper=debug";

/// 初始化日志系统
///
/// # Arguments
/// * `log_level` - 日志级别或过滤表达式，如果为 None 则使用环境变量 RUST_LOG
/// * `log_file` - 日志文件路径，如果为 None 则只输出到标准输出
///
/// # Examples
/// ```no_run
/// use aiw_reaper::utils::logger::init_logger;
///
/// init_logger(Some("debug"), None).unwrap();
/// ```
pub fn init_logger(log_level: Option<&str>, log_file: Option<PathBuf>) -> ReaperResult<()> {
    let env_filter = build_filter(log_level)?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_ansi(true)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Some(log_path) = log_file {
        // 确保日志文件的父目录存在
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        // 文件中不使用 ANSI 颜色
        let file_layer = fmt::layer()
            .with_writer(std::sync::Arc::new(file))
            .with_target(true)
            .with_ansi(false)
            .with_level(true);

        registry
            .with(file_layer)
            .try_init()
            .map_err(|err| errors::config_error(format!("logger already initialized: {err}")))?;
    } else {
        registry
            .try_init()
            .map_err(|err| errors::config_error(format!("logger already initialized: {err}")))?;
    }

    tracing::debug!("logger initialized");
    Ok(())
}

/// 参数优先，其次 RUST_LOG，最后默认规则
fn build_filter(log_level: Option<&str>) -> ReaperResult<EnvFilter> {
    match log_level {
        Some(level) => EnvFilter::try_new(level).map_err(|err| {
            errors::validation_error(
                format!("invalid log filter: {err}"),
                Some("logLevel".to_string()),
                Some(level.to_string()),
            )
        }),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_is_parsed() {
        assert!(build_filter(Some("warn,aiw_reaper=trace")).is_ok());
        assert!(build_filter(Some("aiw_reaper=loud")).is_err());
    }
}
