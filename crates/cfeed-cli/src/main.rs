use std::sync::Arc;

use anyhow::{Context, Result};
use cfeed_storage::PgListingRepository;
use cfeed_sync::{orchestrator_from_config, RepositoryTarget, SyncConfig, SyncRunSummary};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfeed-cli")]
#[command(about = "Classifieds feed command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled site for one day and persist new listings.
    Sync {
        /// Target post date (yyyy-mm-dd); defaults to today in UTC.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Re-run the pipeline for this many days, walking back from --date.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        wipe_days: Option<u32>,
        /// Skip uploading raw artifacts.
        #[arg(long)]
        no_upload: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run today's sync on CFEED_SCHEDULE_CRON until interrupted.
    Schedule {
        #[arg(long)]
        no_upload: bool,
    },
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &SyncRunSummary) {
    let pages: usize = summary.scrapes.iter().map(|s| s.pages).sum();
    println!(
        "sync complete: run_id={} date={} sites={} pages={} scraped={} inserted={} \
         duplicates={} uploaded={}",
        summary.run_id,
        summary.date,
        summary.scrapes.len(),
        pages,
        summary.scraped,
        summary.inserted,
        summary.duplicates,
        summary.uploaded.len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        date: None,
        wipe_days: None,
        no_upload: false,
    }) {
        Commands::Sync {
            date,
            wipe_days,
            no_upload,
        } => {
            let do_upload = !no_upload;
            config.validate(do_upload)?;
            let orchestrator = orchestrator_from_config(&config).await?;
            let cancel = cancel_on_ctrl_c();
            let date = date.unwrap_or_else(|| Utc::now().date_naive());

            let summaries = match wipe_days {
                Some(days) => orchestrator.run_backfill(date, days, do_upload, &cancel).await?,
                None => vec![orchestrator.run_for_date(date, do_upload, &cancel).await?],
            };
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Migrate => match config.repository_target() {
            RepositoryTarget::Postgres(url) => {
                let repository = PgListingRepository::connect(&url).await?;
                repository.migrate().await?;
                println!("migrations applied");
            }
            RepositoryTarget::Memory => {
                anyhow::bail!("DATABASE_URL must point at Postgres to run migrations");
            }
        },
        Commands::Schedule { no_upload } => {
            let do_upload = !no_upload;
            config.validate(do_upload)?;
            let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
            let cancel = CancellationToken::new();
            let mut sched = cfeed_sync::build_scheduler(
                orchestrator,
                &config.schedule_cron,
                do_upload,
                cancel.clone(),
            )
            .await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running, ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
