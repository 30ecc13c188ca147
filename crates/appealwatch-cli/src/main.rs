use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use appealwatch_extract::{GeminiConfig, GeminiExtractor};
use appealwatch_storage::{FsBlobStore, HttpFetcher, PgStore};
use appealwatch_sync::{
    load_registry, maybe_build_scheduler, AppConfig, FetchCycle, FetchCycleSummary,
};

#[derive(Debug, Parser)]
#[command(name = "appealwatch")]
#[command(about = "Tracks housing-project appeals across city council agendas")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch cycle for a single source by city slug
    Fetch {
        #[arg(long)]
        source: String,
    },
    /// Run one fetch cycle for every enabled source
    FetchAll,
    /// Run the recurring weekly scheduler until interrupted
    Schedule,
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::FetchAll) {
        Commands::Fetch { source } => {
            let registry = load_registry(&config.sources_file).await?;
            let entry = registry
                .sources
                .iter()
                .find(|s| s.city_slug == source)
                .with_context(|| {
                    format!(
                        "no source '{source}' in {}",
                        config.sources_file.display()
                    )
                })?;
            let cycle = build_cycle(&config).await?;
            print_summary(&cycle.run(entry).await?);
        }
        Commands::FetchAll => {
            let registry = load_registry(&config.sources_file).await?;
            let cycle = Arc::new(build_cycle(&config).await?);

            // One task per city; a failing source never blocks the others.
            let mut handles = Vec::new();
            for entry in registry.sources.into_iter().filter(|s| s.enabled) {
                let cycle = cycle.clone();
                handles.push(tokio::spawn(async move {
                    let slug = entry.city_slug.clone();
                    (slug, cycle.run(&entry).await)
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok((_, Ok(summary))) => print_summary(&summary),
                    Ok((slug, Err(err))) => eprintln!("{slug}: fetch cycle failed: {err:#}"),
                    Err(err) => eprintln!("fetch task panicked: {err}"),
                }
            }
        }
        Commands::Schedule => {
            let registry = load_registry(&config.sources_file).await?;
            let cycle = Arc::new(build_cycle(&config).await?);
            let Some(scheduler) = maybe_build_scheduler(&config, cycle, registry).await? else {
                bail!("scheduler is disabled; set APPEALWATCH_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await?;
            println!(
                "scheduler running with cron '{}'; press Ctrl-C to stop",
                config.fetch_cron
            );
            tokio::signal::ctrl_c().await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn build_cycle(config: &AppConfig) -> Result<FetchCycle> {
    if config.gemini_api_key.is_empty() {
        bail!("GEMINI_API_KEY is not set");
    }

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let blobs = Arc::new(FsBlobStore::new(config.blobs_dir.clone()));
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let gemini = GeminiConfig::new(config.gemini_api_key.clone())
        .with_model(config.gemini_model.clone());
    let extractor = Arc::new(GeminiExtractor::new(gemini));

    Ok(
        FetchCycle::new(store, blobs, http.clone(), http, extractor)
            .with_defaults(config.default_max_pages, config.default_lookback_months),
    )
}

fn print_summary(summary: &FetchCycleSummary) {
    println!(
        "{}: discovered={} processed={} skipped={} failed={} appeals_touched={}",
        summary.city_slug,
        summary.discovered,
        summary.processed,
        summary.skipped,
        summary.failed,
        summary.appeals_touched
    );
}
