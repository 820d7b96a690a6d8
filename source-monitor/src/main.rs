use anyhow::Context;
use clap::{Parser, Subcommand};
use source_monitor::{
    AdapterRegistry, Clock, CycleOutcome, FetchConfig, FilterRegistry, MonitorConfig, Scheduler, SourceManager,
    SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "source-monitor", about = "Polls sources, filters their items and stores new entries")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://source-monitor.db")]
    database_url: String,

    #[arg(long, env = "MONITOR_WORKERS")]
    workers: Option<usize>,

    /// Seconds between scheduling passes
    #[arg(long, env = "MONITOR_POLL_SECONDS")]
    poll_seconds: Option<u64>,

    /// Interval for sources and groups without their own, e.g. "6h"
    #[arg(long, env = "MONITOR_DEFAULT_INTERVAL")]
    default_interval: Option<String>,

    /// Entries scoring at or below this are created already read
    #[arg(long, env = "MONITOR_AUTO_READ_THRESHOLD", allow_hyphen_values = true)]
    auto_read_threshold: Option<i64>,

    /// Disable a source after this many consecutive configuration errors
    #[arg(long, env = "MONITOR_DISABLE_AFTER")]
    disable_after: Option<u32>,

    #[arg(long, env = "MONITOR_USER_AGENT")]
    user_agent: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run {
        /// Process due sources once and exit
        #[arg(long)]
        once: bool,
    },
    /// Run one cycle for a single source now
    Process { id: Uuid },
    /// Make a source due immediately
    Refresh { id: Uuid },
    /// Apply retention to history fingerprints and old entries
    Prune,
    /// Print row counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("source_monitor=info")))
        .init();

    let cli = Cli::parse();

    let manager = SourceManager::connect(&cli.database_url)
        .await
        .with_context(|| format!("cannot open database {}", cli.database_url))?;

    let config = monitor_config(&cli);
    let mut fetch_config = FetchConfig::default();
    if let Some(user_agent) = &cli.user_agent {
        fetch_config.user_agent = user_agent.clone();
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let adapters = AdapterRegistry::with_defaults(fetch_config)?;
    let scheduler = Scheduler::new(manager.clone(), FilterRegistry::with_defaults(), adapters, clock.clone(), config)?;

    match cli.command {
        Command::Run { once: true } => {
            let reports = scheduler.run_once().await?;
            for report in reports {
                print_report(&report);
            }
        }
        Command::Run { once: false } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for ctrl-c: {}", e);
                    return;
                }
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            });
            scheduler.run(shutdown_rx).await?;
        }
        Command::Process { id } => {
            let report = scheduler.process(id).await?;
            print_report(&report);
        }
        Command::Refresh { id } => {
            manager.refresh(id, clock.now()).await?;
            println!("{} queued", id);
        }
        Command::Prune => {
            scheduler.maintenance().await?;
        }
        Command::Stats => {
            for (key, value) in manager.stats().await? {
                println!("{}: {}", key, value);
            }
        }
    }

    Ok(())
}

fn monitor_config(cli: &Cli) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if let Some(seconds) = cli.poll_seconds {
        config.poll_period = Duration::from_secs(seconds.max(1));
    }
    if let Some(interval) = &cli.default_interval {
        config.default_interval = interval.clone();
    }
    config.auto_read_threshold = cli.auto_read_threshold;
    config.disable_after_config_errors = cli.disable_after;
    config
}

fn print_report(report: &source_monitor::CycleReport) {
    let next = report
        .next_update
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    match &report.outcome {
        CycleOutcome::Updated { new_entries } => {
            println!("{} updated: {} new entries, next {}", report.source_id, new_entries, next)
        }
        CycleOutcome::NotModified => println!("{} not modified, next {}", report.source_id, next),
        CycleOutcome::Failed { category, message } => {
            println!("{} failed ({}): {}, next {}", report.source_id, category, message, next)
        }
        CycleOutcome::Busy => println!("{} busy", report.source_id),
    }
}
