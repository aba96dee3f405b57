use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gridiron_ingest::{build_scheduler, flows_from_settings, FlowSummary, IngestSettings, PgWarehouse};
use serde_json::to_string_pretty;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gridiron")]
#[command(about = "Bronze-layer ingestion for nflverse feeds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the current week, season and snapshot partitions.
    DailyRefresh {
        #[arg(long)]
        season: Option<i32>,
        #[arg(long)]
        week: Option<i32>,
    },
    /// Reload whole seasons.
    Backfill {
        #[arg(long, value_delimiter = ',', required = true)]
        seasons: Vec<i32>,
        #[arg(long, value_delimiter = ',')]
        weeks: Vec<i32>,
    },
    /// Latest applied partition per dataset.
    Status,
    /// Apply the ops schema migrations.
    Migrate,
    /// Run the daily refresh on REFRESH_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridiron=info")))
        .init();
}

fn report(summary: &FlowSummary) -> Result<()> {
    println!("{}", to_string_pretty(summary)?);
    if summary.failed > 0 {
        bail!(
            "{} of {} partitions failed in {}",
            summary.failed,
            summary.total_partitions,
            summary.scope
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let settings = IngestSettings::from_env().context("loading settings")?;

    match cli.command {
        Commands::DailyRefresh { season, week } => {
            let flows = flows_from_settings(&settings).await?;
            report(&flows.daily_refresh(season, week).await)?;
        }
        Commands::Backfill { seasons, weeks } => {
            let flows = flows_from_settings(&settings).await?;
            let weeks = (!weeks.is_empty()).then_some(weeks.as_slice());
            report(&flows.backfill(&seasons, weeks).await)?;
        }
        Commands::Status => {
            let flows = flows_from_settings(&settings).await?;
            let status = flows.list_status().await?;
            println!("{}", to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let warehouse = PgWarehouse::connect(&settings.database_url)
                .await
                .context("connecting to warehouse")?;
            warehouse.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            if !settings.scheduler_enabled {
                bail!("SCHEDULER_ENABLED is not set; refusing to start the scheduler");
            }
            let flows = Arc::new(flows_from_settings(&settings).await?);
            let mut sched = build_scheduler(flows, &settings.refresh_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %settings.refresh_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
