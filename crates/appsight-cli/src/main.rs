use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use appsight_storage::{PgStore, Stores};
use appsight_sync::{live_registry, Orchestrator, Scheduler, SyncConfig};
use appsight_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "appsight")]
#[command(about = "AppSight metrics collection service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API, with the cron loop when enabled.
    Serve,
    /// Run one scheduling tick over all verified users.
    Tick,
    /// Collect every configured source for one user, now.
    Collect {
        #[arg(long)]
        user: Uuid,
    },
    /// Create missing database tables.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

async fn build_stores(config: &SyncConfig) -> Result<Stores> {
    let pg = Arc::new(PgStore::connect(&config.database_url).await?);
    pg.ensure_schema().await?;
    Ok(Stores::from_pg(pg))
}

fn build_orchestrator(config: &SyncConfig, stores: &Stores) -> Result<Arc<Orchestrator>> {
    let registry = Arc::new(live_registry(config)?);
    Ok(Arc::new(Orchestrator::new(
        stores.clone(),
        registry,
        config.source_timeout(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let stores = build_stores(&config).await?;
            let orchestrator = build_orchestrator(&config, &stores)?;
            let scheduler = Scheduler::new(stores.clone(), orchestrator.clone());
            let running = if config.scheduler_enabled {
                Some(scheduler.start(&config.collection_cron).await?)
            } else {
                None
            };
            appsight_web::serve(AppState::new(stores, orchestrator)).await?;
            if let Some(running) = running {
                running.stop().await?;
            }
        }
        Commands::Tick => {
            let stores = build_stores(&config).await?;
            let orchestrator = build_orchestrator(&config, &stores)?;
            let scheduler = Scheduler::new(stores, orchestrator);
            let summary = scheduler.run_tick().await?;
            println!(
                "tick complete: eligible={} collected={} skipped={} fulfilled={} rejected={}",
                summary.eligible_users,
                summary.collected_users,
                summary.skipped_users,
                summary.fulfilled_sources,
                summary.rejected_sources
            );
        }
        Commands::Collect { user } => {
            let stores = build_stores(&config).await?;
            let orchestrator = build_orchestrator(&config, &stores)?;
            let outcomes = orchestrator.collect_for_user(user).await?;
            if outcomes.is_empty() {
                println!("no configured sources for user {user}");
            }
            for outcome in &outcomes {
                match &outcome.error {
                    None => println!("{}: ok", outcome.source),
                    Some(error) => println!("{}: failed ({error})", outcome.source),
                }
            }
        }
        Commands::Migrate => {
            build_stores(&config).await?;
            println!("schema ensured");
        }
    }

    Ok(())
}
