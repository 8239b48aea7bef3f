//! Execution worker binary
//!
//! Drains the code-execution queue into the Docker sandbox. Each slot
//! consumes one message at a time; run several slots (or several worker
//! processes) against the same data directory to scale out. A background
//! task sweeps expired messages to the dead-letter queue, and Ctrl+C or
//! SIGTERM drains in-flight work before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use crucible_core::config::ConfigLoader;
use crucible_core::queue::standard_topology;
use crucible_core::store::{FileResultStore, PermissiveSessions};
use crucible_core::{DockerSandbox, DurableQueue, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Crucible Worker - drains the execution queue into Docker")]
struct Cli {
    #[clap(long, short, help = "Configuration file (YAML); defaults apply when omitted")]
    config: Option<String>,

    #[clap(long, default_value = "1", help = "Consumer slots to run in this process")]
    concurrency: usize,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = match &cli.config {
        Some(path) => {
            log::info!("loading configuration from {path}");
            ConfigLoader::from_file(path).await?
        }
        None => ConfigLoader::from_defaults()?,
    };
    let registry = Arc::new(config.language_registry());

    let queue = Arc::new(
        DurableQueue::open(
            config.data_dir.join("queue"),
            standard_topology(&config.queue),
        )
        .await?,
    );
    let store = Arc::new(FileResultStore::open(config.data_dir.join("store")).await?);

    let sandbox = Arc::new(DockerSandbox::new(config.sandbox.clone())?);
    sandbox
        .initialize(&registry)
        .await
        .context("Docker is required to run the worker")?;

    let worker = Arc::new(Worker::new(
        queue.clone(),
        sandbox,
        Arc::new(PermissiveSessions),
        store,
        registry,
        WorkerConfig::from(&config.queue),
    ));

    let shutdown = CancellationToken::new();

    // TTL sweep: expired messages move to the dead-letter queue.
    let sweeper_queue = queue.clone();
    let sweeper_shutdown = shutdown.clone();
    let sweep_interval = Duration::from_millis(config.tracker.sweep_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = sweeper_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match sweeper_queue.sweep_expired().await {
                        Ok(0) => {}
                        Ok(n) => log::info!("ttl sweep dead-lettered {n} messages"),
                        Err(e) => log::warn!("ttl sweep failed: {e}"),
                    }
                }
            }
        }
    });

    let slots = cli.concurrency.max(1);
    log::info!("starting {slots} consumer slot(s)");
    let mut handles = Vec::with_capacity(slots);
    for slot in 0..slots {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                log::error!("consumer slot {slot} exited with error: {e}");
            }
        }));
    }

    wait_for_signal().await;
    log::info!("shutting down, draining in-flight work");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received Ctrl+C"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}
