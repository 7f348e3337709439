mod config;
mod ingest;
mod metrics;

use clap::{Parser, Subcommand};
use localblocks_core::storage::{BlockMeta, LocalEncoding, LocalWal};
use localblocks_core::{BlockManager, LocalBlocksConfig, Processor, PrometheusMetrics, SystemClock};
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest length-prefixed OTLP trace frames from stdin until EOF or Ctrl-C
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "config.toml", env = "LOCALBLOCKS_CONFIG")]
        config: PathBuf,
    },
    /// Print the write-ahead and complete blocks of the configured tenant
    Blocks {
        /// Path to config file
        #[arg(short, long, default_value = "config.toml", env = "LOCALBLOCKS_CONFIG")]
        config: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    match args.command {
        Command::Run { config } => {
            let config = Config::load(&config)?;
            init_tracing(&config.general.log_level);
            run(config).await
        }
        Command::Blocks { config } => {
            let config = Config::load(&config)?;
            init_tracing(&config.general.log_level);
            blocks(config)
        }
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let registry = Registry::new();
    let metrics = Arc::new(PrometheusMetrics::new(&registry)?);
    let wal = Arc::new(LocalWal::new(config.wal.path.clone())?);

    info!("Opening WAL at {:?} for tenant {}", config.wal.path, config.general.tenant);
    let processor = Processor::new(
        config.local_blocks.clone(),
        &config.general.tenant,
        wal,
        Arc::new(LocalEncoding),
        metrics,
    )
    .await?;

    if config.metrics.enabled {
        let host = config.metrics.host.clone();
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(registry, host, port).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let mut frames = ingest::spawn_reader(std::io::stdin())?;
    tokio::select! {
        res = ingest::ingest(&mut frames, &processor) => match res {
            Ok(frames) => info!(frames, "Input closed"),
            Err(e) => error!("Ingestion stopped: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    processor.shutdown().await;
    Ok(())
}

fn print_block(state: &str, meta: &BlockMeta) {
    println!(
        "{:<9} {:<36} {:>8} {:>12}  {} .. {}",
        state,
        meta.block_id,
        meta.total_objects,
        meta.size,
        meta.start_time.format("%Y-%m-%dT%H:%M:%SZ"),
        meta.end_time.format("%Y-%m-%dT%H:%M:%SZ"),
    );
}

/// Lists the tenant's blocks from disk. Read-only, so it can run next to a
/// live `run` on the same WAL directory.
fn blocks(config: Config) -> Result<(), anyhow::Error> {
    let wal = Arc::new(LocalWal::new(config.wal.path.clone())?);
    let local_blocks: LocalBlocksConfig = config.local_blocks;
    let manager = BlockManager::new(
        &config.general.tenant,
        local_blocks,
        wal,
        Arc::new(LocalEncoding),
        Arc::new(SystemClock),
    );
    let inventory = manager.inspect_blocks()?;

    println!(
        "{:<9} {:<36} {:>8} {:>12}  {}",
        "STATE", "BLOCK", "OBJECTS", "BYTES", "TIME RANGE"
    );
    for meta in &inventory.wal {
        print_block("wal", meta);
    }
    for meta in &inventory.complete {
        print_block("complete", meta);
    }
    println!(
        "{} write-ahead, {} complete, {} bytes",
        inventory.wal.len(),
        inventory.complete.len(),
        inventory.total_bytes()
    );
    Ok(())
}
