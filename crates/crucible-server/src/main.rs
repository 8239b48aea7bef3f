//! HTTP gateway binary for the Crucible execution pipeline
//!
//! Wires the gateway onto the durable queue, the Docker sandbox (for
//! inline runs and session kills), and the file-backed result store,
//! then serves the HTTP API until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use crucible_core::admission::AdmissionPolicy;
use crucible_core::config::ConfigLoader;
use crucible_core::queue::standard_topology;
use crucible_core::store::{FileResultStore, PermissiveSessions};
use crucible_core::{DockerSandbox, DurableQueue, ExecutionGateway, PendingTracker};

use crucible_server::{serve_with_shutdown, shutdown_signal};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Crucible Server - HTTP gateway for sandboxed code execution")]
struct Cli {
    #[clap(long, short, help = "Configuration file (YAML); defaults apply when omitted")]
    config: Option<String>,

    #[clap(long, default_value = "127.0.0.1:3000")]
    bind_addr: String,

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

    let bind_addr: SocketAddr = cli
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", cli.bind_addr))?;

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
        .context("Docker is required for inline execution and session kills")?;

    let tracker = Arc::new(PendingTracker::new(config.tracker.capacity));
    let gateway = Arc::new(ExecutionGateway::new(
        AdmissionPolicy::new(config.admission.clone()),
        config.limits.clone(),
        config.tracker.clone(),
        registry,
        queue,
        sandbox,
        Arc::new(PermissiveSessions),
        store,
        tracker,
    ));

    let shutdown = CancellationToken::new();
    gateway.spawn_sweeper(shutdown.clone());

    let result = serve_with_shutdown(gateway, bind_addr, shutdown_signal()).await;
    shutdown.cancel();
    result
}
