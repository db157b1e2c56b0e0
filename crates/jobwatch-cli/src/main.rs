use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobwatch_sync::{SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "itjobs.pt listing tracker: scrape, merge into history, browse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape once and merge into the history file.
    Sync,
    /// Serve the read-only dashboard (plus the scheduler when enabled).
    Serve,
    /// Run the cron scheduler until ctrl-c.
    Schedule,
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobwatch=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = jobwatch_sync::run_sync_once_from_env().await?;
            let (added, deactivated) = summary
                .merge
                .map(|m| (m.added, m.deactivated))
                .unwrap_or_default();
            println!(
                concat!(
                    "sync complete: run_id={} status={:?} scraped={} added={} ",
                    "deactivated={} rows={} reports={}",
                ),
                summary.run_id,
                summary.status,
                summary.raw_listings,
                added,
                deactivated,
                summary.dataset_rows,
                summary.reports_dir
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);
            let scheduler = jobwatch_sync::maybe_build_scheduler(pipeline).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running alongside dashboard");
            }
            jobwatch_web::serve_from_env().await?;
            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            jobwatch_sync::run_scheduler_until_ctrl_c(pipeline).await?;
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!(
                "{}",
                jobwatch_sync::report_daily_markdown(runs, &config.reports_dir)?
            );
        }
    }

    Ok(())
}
