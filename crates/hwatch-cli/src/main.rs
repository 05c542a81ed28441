use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hwatch_sync::{builtin_sources, WatchConfig, WatchPipeline};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "hwatch")]
#[command(about = "Watch GT health pages for new daily reports")]
struct Cli {
    /// Config file; falls back to HWATCH_CONFIG, then ./config.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One invocation per configured source.
    Run {
        #[arg(long)]
        source: Option<String>,
    },
    Migrate,
    /// Read-only JSON API over stored reports.
    Serve,
    /// Stay resident and run on the configured cron.
    Watch,
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = WatchConfig::resolve_path(cli.config);

    match cli.command.unwrap_or(Commands::Run { source: None }) {
        Commands::Run { source } => {
            let config = WatchConfig::load(&config_path).await?;
            run(&config, source.as_deref()).await?;
        }
        Commands::Migrate => {
            let config = WatchConfig::load(&config_path).await?;
            let store = hwatch_sync::connect_report_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = WatchConfig::load(&config_path).await?;
            hwatch_web::serve(&config).await?;
        }
        Commands::Watch => {
            let config = WatchConfig::load(&config_path).await?;
            watch(&config).await?;
        }
        Commands::Sources => {
            for source in builtin_sources() {
                println!(
                    "{:<8} /gt-jpj/{:<8} {:<20} {}",
                    source.id, source.api_path, source.marker_key, source.url
                );
            }
        }
    }

    Ok(())
}

async fn run(config: &WatchConfig, only: Option<&str>) -> Result<()> {
    let sources = config.selected_sources(only)?;
    let pipeline = WatchPipeline::new(hwatch_sync::connect_context(config).await?);

    let mut failed = Vec::new();
    for (source_id, result) in pipeline.run_all(&sources).await {
        match result {
            Ok(outcome) => println!("{source_id}: {}", outcome.summary()),
            Err(err) => {
                println!("{source_id}: {} ({err})", err.terminal_state());
                failed.push(source_id);
            }
        }
    }
    if !failed.is_empty() {
        bail!("{} source(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

async fn watch(config: &WatchConfig) -> Result<()> {
    let sources = config.selected_sources(None)?;
    let pipeline = Arc::new(WatchPipeline::new(
        hwatch_sync::connect_context(config).await?,
    ));
    let mut sched = hwatch_sync::build_scheduler(pipeline, sources, &config.scheduler.cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.scheduler.cron, "watching; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    if let Err(err) = sched.shutdown().await {
        error!(error = %err, "scheduler shutdown failed");
    }
    Ok(())
}
