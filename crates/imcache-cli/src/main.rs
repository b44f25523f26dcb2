use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use imcache_core::DATE_FORMAT;
use imcache_storage::{PgStore, Store};
use imcache_sync::{
    maybe_build_scheduler, resolve_date_keyword, SyncConfig, SyncDriver, SyncMode, SyncReport,
};
use imcache_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "imcache")]
#[command(about = "NASA imagery metadata cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the picture of the day for one date, or backfill past days.
    Fetch {
        /// YYYY-MM-DD, `today` or `yesterday`.
        #[arg(default_value = "yesterday")]
        date: String,
        /// Fetch the N days before today instead of a single date.
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..=365))]
        backfill: Option<u32>,
    },
    /// Refresh whatever the feed currently publishes.
    Latest,
    /// Sync the layer catalog.
    Layers {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        verify_tiles: bool,
    },
    /// Create the built-in named coordinates that are missing.
    Seed,
    PurgeAudit {
        /// Retention window; defaults to IMCACHE_AUDIT_RETENTION_DAYS.
        #[arg(long)]
        days: Option<u32>,
    },
    Status,
    Migrate,
    Serve,
    /// Run only the cron jobs until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Fetch { date, backfill } => {
            let driver = build_driver(&config).await?;
            match backfill {
                Some(days) => {
                    let report = driver.run(SyncMode::Backfill(days)).await;
                    println!(
                        "backfill complete: {} of {} days fetched",
                        report.success_count(),
                        report.total()
                    );
                    print_failures(&report);
                }
                None => {
                    let Some(date) = resolve_date_keyword(&date, Utc::now().date_naive()) else {
                        bail!("invalid date {date:?}, expected YYYY-MM-DD, today or yesterday");
                    };
                    let report = driver.run(SyncMode::SingleDate(date)).await;
                    if !report.is_success() {
                        print_failures(&report);
                        bail!("fetch failed for {}", date.format(DATE_FORMAT));
                    }
                    println!("fetched daily image for {}", date.format(DATE_FORMAT));
                }
            }
        }
        Commands::Latest => {
            let driver = build_driver(&config).await?;
            let report = driver.run(SyncMode::Latest).await;
            if !report.is_success() {
                print_failures(&report);
                bail!("latest refresh failed");
            }
            if let Some(item) = report.items.first() {
                println!(
                    "latest: {} {}",
                    item.key,
                    item.label.as_deref().unwrap_or_default()
                );
            }
        }
        Commands::Layers {
            force,
            verify_tiles,
        } => {
            let driver = build_driver(&config).await?;
            let report = driver
                .run(SyncMode::FullCatalog {
                    force,
                    verify_tiles,
                })
                .await;
            if let Some(err) = &report.error {
                bail!("layer catalog sync failed: {err}");
            }
            println!(
                "layers: created={} updated={} skipped={} failed={} unavailable={}",
                report.tally.created,
                report.tally.updated,
                report.tally.skipped,
                report.tally.failed,
                report.unavailable
            );
            print_failures(&report);
        }
        Commands::Seed => {
            let driver = build_driver(&config).await?;
            let report = driver.seed_coordinates().await;
            println!("seeded {} coordinates", report.tally.created);
            print_failures(&report);
        }
        Commands::PurgeAudit { days } => {
            let driver = build_driver(&config).await?;
            let retention = days
                .map(|d| Duration::days(i64::from(d)))
                .unwrap_or_else(|| config.audit_retention());
            let purged = driver.purge_audit(retention).await?;
            println!("purged {purged} audit entries");
        }
        Commands::Status => {
            let store = connect_store(&config).await?;
            let status = store.status_summary().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let driver = Arc::new(build_driver(&config).await?);
            let scheduler = maybe_build_scheduler(driver.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            imcache_web::serve(AppState::new(driver), config.web_port).await?;
        }
        Commands::Schedule => {
            let driver = Arc::new(build_driver(&config).await?);
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let Some(mut sched) = maybe_build_scheduler(driver, &config).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(latest = %config.latest_cron, cleanup = %config.cleanup_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("IMCACHE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

async fn build_driver(config: &SyncConfig) -> Result<SyncDriver> {
    let store = connect_store(config).await?;
    SyncDriver::from_config(config, store).context("building sync driver")
}

fn print_failures(report: &SyncReport) {
    for item in report.items.iter().filter(|i| i.error.is_some()) {
        eprintln!(
            "  failed {}: {}",
            item.key,
            item.error.as_deref().unwrap_or_default()
        );
    }
}
