use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use claude_session_monitor::{
    daemon::{DaemonPaths, MonitorDaemon},
    models::{MonitorConfig, MonitoringSnapshot, SessionStatus},
    services::{snapshot_store::SnapshotStore, usage_executor::UsageExecutor, LogNotificationSink},
};
use colored::Colorize;
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "claude-session-monitor")]
#[command(about = "Background daemon fusing Claude billing blocks and hook activity into one status snapshot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory override (default: platform data dir)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbose output (debug logging to debug.log)
    #[arg(short, long)]
    verbose: bool,

    /// Show about information including version and build details
    #[arg(long)]
    about: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring daemon (default)
    Monitor,
    /// Show the current persisted snapshot
    Status,
    /// Configure the monitor
    Config {
        /// Day of month (1-31) the billing period starts on
        #[arg(long)]
        billing_start_day: Option<u32>,
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
        /// Token alert threshold as a fraction of the historical max (0.0-1.0)
        #[arg(long)]
        token_threshold: Option<f64>,
        /// Cost alert threshold as a fraction of the historical max (0.0-1.0)
        #[arg(long)]
        cost_threshold: Option<f64>,
        /// Minutes before a continuously engaged session triggers an alert
        #[arg(long)]
        long_session_minutes: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.about {
        show_about();
        return Ok(());
    }

    // Initialize logging
    if cli.verbose {
        // Log to file when verbose
        use std::fs::OpenOptions;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open("debug.log")?;

        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Debug)
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .init();
    } else {
        // Normal logging to stderr for info/warn/error
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Setup data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-session-monitor")
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    match cli.command {
        Some(Commands::Monitor) | None => {
            let config = load_or_create_config(&data_dir)?;
            run_monitor(data_dir, config).await?;
        }
        Some(Commands::Status) => {
            show_status(&data_dir)?;
        }
        Some(Commands::Config {
            billing_start_day,
            interval,
            token_threshold,
            cost_threshold,
            long_session_minutes,
        }) => {
            configure_monitor(
                &data_dir,
                billing_start_day,
                interval,
                token_threshold,
                cost_threshold,
                long_session_minutes,
            )?;
        }
    }

    Ok(())
}

async fn run_monitor(data_dir: PathBuf, config: MonitorConfig) -> Result<()> {
    println!("🧠 Claude Session Monitor");
    println!(
        "Polling every {}s, billing period starts on day {}",
        config.poll_interval_seconds, config.billing_start_day
    );
    println!("Snapshot: {}", data_dir.join("snapshot.json").display());

    let paths = DaemonPaths::under(&data_dir);
    let executor = Arc::new(UsageExecutor::new(Duration::from_secs(
        config.process_timeout_seconds,
    )));
    let mut daemon = MonitorDaemon::new(config, paths, executor, LogNotificationSink);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(shutdown_rx).await
}

fn show_status(data_dir: &PathBuf) -> Result<()> {
    let store = SnapshotStore::new(data_dir.join("snapshot.json"));
    let snapshot = match store.load() {
        Some(snapshot) => snapshot,
        None => {
            println!("❌ No snapshot found - is the monitor daemon running?");
            return Ok(());
        }
    };

    print_snapshot(&snapshot);
    Ok(())
}

fn print_snapshot(snapshot: &MonitoringSnapshot) {
    println!("{}", "📊 Claude Session Monitor - Status".bright_cyan().bold());
    println!(
        "  Billing period: {} → {}",
        snapshot.period_start, snapshot.period_end
    );

    let total_tokens: u64 = snapshot.billing_sessions.iter().map(|s| s.total_tokens).sum();
    let total_cost: f64 = snapshot.billing_sessions.iter().map(|s| s.cost_usd).sum();
    println!(
        "  Usage: {} sessions, {} tokens, ${:.2}",
        snapshot.billing_sessions.len(),
        total_tokens,
        total_cost
    );
    println!(
        "  All-time high: {} tokens, ${:.2}",
        snapshot.maxima.max_tokens, snapshot.maxima.max_cost_usd
    );

    if snapshot.activity_sessions.is_empty() {
        println!("  Activity: none");
    } else {
        println!("  Activity:");
        for session in &snapshot.activity_sessions {
            let status = match session.status {
                SessionStatus::Active => "ACTIVE".bright_green().bold(),
                SessionStatus::WaitingForUser => "WAITING".bright_yellow().bold(),
                SessionStatus::Idle => "IDLE".bright_blue(),
                SessionStatus::Inactive => "INACTIVE".dimmed(),
            };
            println!(
                "    {:<24} {} (last event {})",
                session.project_name,
                status,
                humantime::format_rfc3339_seconds(session.last_event_time.into())
            );
        }
    }

    let age = Utc::now().signed_duration_since(snapshot.last_updated);
    let age_std = age.to_std().unwrap_or_default();
    println!("  Updated {} ago", humantime::format_duration(trim_to_seconds(age_std)));

    if let Some(error) = &snapshot.error {
        println!(
            "  {} {} ({} consecutive failures)",
            "⚠️".bright_yellow(),
            error.message.bright_yellow(),
            error.consecutive_failures
        );
    }
}

/// Sub-second noise makes the "updated ago" line unreadable.
fn trim_to_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

fn configure_monitor(
    data_dir: &PathBuf,
    billing_start_day: Option<u32>,
    interval: Option<u64>,
    token_threshold: Option<f64>,
    cost_threshold: Option<f64>,
    long_session_minutes: Option<i64>,
) -> Result<()> {
    let mut config = load_or_create_config(data_dir)?;

    if let Some(day) = billing_start_day {
        config.billing_start_day = day;
        println!("✅ Set billing start day to: {day}");
    }

    if let Some(interval_val) = interval {
        config.poll_interval_seconds = interval_val;
        println!("✅ Set poll interval to: {interval_val} seconds");
    }

    if let Some(threshold) = token_threshold {
        if (0.0..=1.0).contains(&threshold) {
            config.alerts.token_threshold = threshold;
            println!("✅ Set token alert threshold to: {:.1}%", threshold * 100.0);
        } else {
            println!("❌ Token threshold must be between 0.0 and 1.0");
        }
    }

    if let Some(threshold) = cost_threshold {
        if (0.0..=1.0).contains(&threshold) {
            config.alerts.cost_threshold = threshold;
            println!("✅ Set cost alert threshold to: {:.1}%", threshold * 100.0);
        } else {
            println!("❌ Cost threshold must be between 0.0 and 1.0");
        }
    }

    if let Some(minutes) = long_session_minutes {
        config.alerts.long_session_minutes = minutes;
        println!("✅ Set long session alert to: {minutes} minutes");
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Save configuration
    let config_path = data_dir.join("config.json");
    let content = serde_json::to_string_pretty(&config)?;
    std::fs::write(&config_path, content)?;

    Ok(())
}

fn load_or_create_config(data_dir: &PathBuf) -> Result<MonitorConfig> {
    let config_path = data_dir.join("config.json");

    let config: MonitorConfig = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed config at {}", config_path.display()))?
    } else {
        let config = MonitorConfig::default();
        let content = serde_json::to_string_pretty(&config)?;
        std::fs::write(&config_path, content)?;
        config
    };

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Display about information including version and build details
fn show_about() {
    println!("{}", "📡 Claude Session Monitor".bright_cyan().bold());
    println!();
    println!("{}", "📋 Version Information:".bright_yellow().bold());
    println!("  Version: {}", env!("CARGO_PKG_VERSION").bright_green());
    println!("  Name: {}", "claude-session-monitor".bright_white());
    println!("  Description: {}", env!("CARGO_PKG_DESCRIPTION"));
    if let Some(build_time) = option_env!("CLAUDE_SESSION_MONITOR_BUILD_TIME") {
        println!("  Built: {build_time}");
    }
    if let Some(git_hash) = option_env!("CLAUDE_SESSION_MONITOR_GIT_HASH") {
        println!("  Commit: {git_hash}");
    }
    println!();
    println!("{}", "💡 Usage:".bright_green().bold());
    println!("  claude-session-monitor monitor");
    println!("  claude-session-monitor status");
    println!("  claude-session-monitor config --billing-start-day 17");
}
