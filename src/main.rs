//! arbscan entry point.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! RPC outage, 3 store unavailable at startup.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::watch;
use tracing::{error, info};

use arbscan::orchestrator::{ExitReason, Orchestrator};
use arbscan::stats::Stats;
use arbscan::store::{BufferedStore, SqliteStore};
use arbscan::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "arbscan", about = "Read-only DEX arbitrage opportunity scanner")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ARBSCAN_CONFIG", default_value = "arbscan.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "arbscan=info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %cli.config, "configuration error");
            return 1;
        }
    };
    info!(
        endpoints = config.endpoints.len(),
        venues = config.venues.len(),
        pairs = config.pairs.len(),
        cycles = config.cycles.len(),
        "configuration loaded"
    );

    let store = match SqliteStore::open(&config.store.path) {
        Ok(store) => Arc::new(BufferedStore::new(store, config.store.buffer_limit)),
        Err(e) => {
            error!(error = %e, path = %config.store.path, "store unavailable at startup");
            return 3;
        }
    };

    let stats = Arc::new(Stats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Err(e) = spawn_signal_handler(shutdown_tx) {
        error!(error = %e, "failed to install signal handler");
        return 1;
    }

    let orchestrator = Orchestrator::new(config, store, stats);
    match orchestrator.run(shutdown_rx).await {
        ExitReason::Clean => {
            info!("clean shutdown");
            0
        }
        ExitReason::RpcOutage => {
            error!("unrecoverable rpc outage");
            2
        }
        ExitReason::StoreOutage => {
            error!("store outage beyond tolerance");
            3
        }
        ExitReason::TaskFailure(task) => {
            error!(task, "background task failure");
            2
        }
    }
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "shutdown signal received");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}
