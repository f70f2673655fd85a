use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phi_core::ListingId;
use phi_sync::{DetailSelection, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "phi-cli")]
#[command(about = "Public housing listing index")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rewrite the whole listing region from the database.
    Sync,
    /// Put one new listing at the top of the index.
    Append { listing_id: ListingId },
    /// Drop entries whose listings no longer exist.
    Prune,
    /// Load enabled sources into the database, then resync if anything was saved.
    Ingest,
    Migrate,
    /// Run cron-driven resyncs until interrupted.
    Schedule,
    /// Print the newest listing still waiting for a video, as JSON.
    VideoBacklog,
    SetVideo { listing_id: ListingId, url: String },
    /// Listings whose application window ends on or after `days` days ago.
    Recent {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Regenerate per-listing detail pages: all of them, one agency's, or recent ones.
    Pages {
        #[arg(long, conflicts_with = "recent_days")]
        agency: Option<String>,
        #[arg(long)]
        recent_days: Option<i64>,
    },
    /// Markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let outcome = phi_sync::run_full_resync_from_env().await?;
            println!(
                "resync complete: entries={} added={} dropped={} unchanged={} report={}",
                outcome.report.entries_written,
                outcome.report.added.len(),
                outcome.report.dropped.len(),
                outcome.report.unchanged,
                outcome.report_dir.display()
            );
        }
        Commands::Append { listing_id } => {
            let outcome = phi_sync::run_append_from_env(listing_id).await?;
            println!(
                "append {}: appended={} report={}",
                listing_id,
                outcome.report.appended,
                outcome.report_dir.display()
            );
        }
        Commands::Prune => {
            let outcome = phi_sync::run_prune_from_env().await?;
            println!(
                "prune complete: removed={} not_removed={} report={}",
                outcome.report.removed.len(),
                outcome.report.not_removed.len(),
                outcome.report_dir.display()
            );
        }
        Commands::Ingest => {
            let outcome = phi_sync::run_ingest_from_env().await?;
            let batch = &outcome.ingest.report.batch;
            println!(
                "ingest complete: processed={} saved={} skipped={} failed={} report={}",
                batch.processed,
                batch.succeeded,
                batch.skipped,
                batch.failed,
                outcome.ingest.report_dir.display()
            );
            if let Some(resync) = outcome.resync {
                println!(
                    "resync complete: entries={} report={}",
                    resync.report.entries_written,
                    resync.report_dir.display()
                );
            }
        }
        Commands::Migrate => {
            phi_sync::run_migrations_from_env().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let sync = Arc::new(config.index_sync(config.connect().await?));
            let Some(mut sched) = phi_sync::maybe_build_scheduler(&config, sync).await? else {
                eprintln!("scheduler disabled; set PHI_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::VideoBacklog => match phi_sync::video_backlog_from_env().await? {
            Some(listing) => println!("{}", serde_json::to_string_pretty(&listing)?),
            None => println!("no listing is waiting for a video"),
        },
        Commands::SetVideo { listing_id, url } => {
            if phi_sync::set_video_url_from_env(listing_id, &url).await? {
                println!("video url recorded for {listing_id}");
            } else {
                anyhow::bail!("listing {listing_id} not found");
            }
        }
        Commands::Recent { days } => {
            for listing in phi_sync::recent_from_env(days).await? {
                println!(
                    "{}\t{}\t{} {}\t{}",
                    listing.listing_id,
                    listing.apply_end.as_deref().unwrap_or("-"),
                    listing.province.as_deref().unwrap_or(""),
                    listing.city.as_deref().unwrap_or(""),
                    listing.summary.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Pages {
            agency,
            recent_days,
        } => {
            let selection = match (agency, recent_days) {
                (Some(agency_id), _) => DetailSelection::Agency { agency_id },
                (None, Some(days)) => DetailSelection::Recent { days },
                (None, None) => DetailSelection::All,
            };
            let outcome = phi_sync::run_detail_pages_from_env(selection).await?;
            println!(
                "detail pages: selected={} written={} failed={} report={}",
                outcome.report.batch.processed,
                outcome.report.written_ids().len(),
                outcome.report.batch.failed,
                outcome.report_dir.display()
            );
        }
        Commands::Report { runs } => {
            println!("{}", phi_sync::report_from_env(runs)?);
        }
    }

    Ok(())
}
