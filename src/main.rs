use aiw_reaper::config::{default_config_path, ReaperConfig};
use aiw_reaper::core::scan_gate::ScanOutcome;
use aiw_reaper::error::ReaperError;
use aiw_reaper::report::table_format::{
    format_cleanups_table, format_processes_table, format_zombies_table,
};
use aiw_reaper::signal::shutdown_signal;
use aiw_reaper::utils::logger::init_logger;
use aiw_reaper::{platform, ProcessMonitor, ReaperSupervisor, ZombieDetector};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

/// 僵尸进程回收守护进程
#[derive(Parser, Debug)]
#[command(
    name = "aiw-reaper",
    about = "Discover and reclaim zombie processes left behind by AI CLI tooling",
    version,
    disable_help_subcommand = true
)]
struct Cli {
    /// 配置文件路径（默认 ~/.aiw/reaper.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别或过滤表达式（默认读取 RUST_LOG）
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// 同时写入日志文件
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 持续监控并清理僵尸进程，直到收到 Ctrl-C / SIGTERM
    Run,

    /// 扫描一次进程表
    Scan {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
        /// 只显示被标记为僵尸的进程
        #[arg(long)]
        zombies_only: bool,
    },

    /// 扫描并运行一次检测
    Analyze {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 显示生效的配置
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match main_impl(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ReaperError>() {
                Some(reaper_err) => eprintln!(
                    "{} {}",
                    format!("[{}]", reaper_err.category()).red(),
                    reaper_err.user_message()
                ),
                None => eprintln!("{} {:#}", "error:".red(), err),
            }
            ExitCode::from(1)
        }
    }
}

async fn main_impl(cli: Cli) -> Result<()> {
    // 一次性命令默认只输出警告，避免日志淹没表格
    let log_level = match cli.command {
        Commands::Run => cli.log_level.clone(),
        _ => cli.log_level.clone().or_else(|| Some("warn".to_string())),
    };
    init_logger(log_level.as_deref(), cli.log_file.clone())?;

    let config = ReaperConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Scan { json, zombies_only } => scan(config, json, zombies_only).await,
        Commands::Analyze { json } => analyze(config, json).await,
        Commands::Config => show_config(&config, cli.config),
    }
}

async fn run(config: ReaperConfig) -> Result<()> {
    let supervisor = ReaperSupervisor::with_platform_defaults(config)?;
    supervisor.run_until(shutdown_signal()).await?;

    let stats = supervisor.cleaner().stats();
    let completed = supervisor.cleaner().get_completed_cleanups(None);
    if !completed.is_empty() {
        println!("{}", format_cleanups_table(&completed));
    }
    println!(
        "{} {} reclaimed, {} failed, {} still active",
        "reaper stopped:".bold(),
        stats.succeeded.to_string().green(),
        stats.failed.to_string().red(),
        stats.active
    );
    Ok(())
}

async fn scan_once(config: &ReaperConfig) -> Result<ProcessMonitor> {
    let monitor = ProcessMonitor::new(config.monitor.clone(), platform::default_enumerator());
    let mut events = monitor.subscribe();
    match monitor.scan().await {
        ScanOutcome::Completed(_) => Ok(monitor),
        ScanOutcome::Skipped => bail!("another scan is already running"),
        ScanOutcome::Failed => {
            let reason = match events.try_recv() {
                Ok(aiw_reaper::MonitorEvent::Error(err)) => err.user_message(),
                _ => "unknown error".to_string(),
            };
            bail!("process scan failed: {reason}")
        }
    }
}

async fn scan(config: ReaperConfig, json: bool, zombies_only: bool) -> Result<()> {
    let monitor = scan_once(&config).await?;
    let processes = if zombies_only {
        monitor.get_zombie_processes()
    } else {
        monitor.get_tracked_processes()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
        return Ok(());
    }

    println!("{}", format_processes_table(&processes));
    let stats = monitor.stats();
    let zombies = stats.zombie_processes.to_string();
    println!(
        "{} processes, {} flagged as zombie",
        stats.tracked_processes,
        if stats.zombie_processes > 0 {
            zombies.yellow()
        } else {
            zombies.green()
        }
    );
    Ok(())
}

async fn analyze(config: ReaperConfig, json: bool) -> Result<()> {
    let monitor = scan_once(&config).await?;
    let detector = ZombieDetector::new(config.detector.clone())?;
    detector.update_tracked(monitor.get_tracked_processes());
    detector.run_analysis_cycle();
    let zombies = detector.get_zombies();

    if json {
        println!("{}", serde_json::to_string_pretty(&zombies)?);
        return Ok(());
    }

    println!("{}", format_zombies_table(&zombies));
    println!(
        "{} processes analyzed, {} confirmed at threshold {:.2}",
        detector.tracked_count(),
        if zombies.is_empty() {
            "0".green()
        } else {
            zombies.len().to_string().red()
        },
        config.detector.confidence_threshold
    );
    Ok(())
}

fn show_config(config: &ReaperConfig, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let source = if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, defaults)", path.display())
    };
    println!("{} {}", "config:".bold(), source);
    println!(
        "{}",
        serde_json::to_string_pretty(config).context("failed to render configuration")?
    );
    Ok(())
}
