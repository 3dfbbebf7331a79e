//! Bandwidth shaping download server.
//!
//! Serves a fixed-size payload over a [`ShapedListener`] so every response
//! is paced by a per-connection cap and an aggregate cap shared fairly by
//! all open connections.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────┐
//!                      │                 BWSHAPER                      │
//!                      │                                               │
//!   Client Request     │  ┌──────────────┐    ┌─────────┐              │
//!   ───────────────────┼─▶│    net       │───▶│  http   │  /download   │
//!                      │  │ShapedListener│    │ server  │  /health     │
//!                      │  └──────┬───────┘    └────┬────┘              │
//!                      │         │ Shaper           │ AppState         │
//!   Paced Response     │  ┌──────▼───────┐    ┌────▼────┐              │
//!   ◀──────────────────┼──│ShapedConn    │    │  admin  │◀── bwshaper-cli
//!                      │  │local+global  │    │  API    │              │
//!                      │  └──────────────┘    └─────────┘              │
//!                      │                                               │
//!                      │  config (watcher) · observability · lifecycle │
//!                      └───────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use bwshaper::admin;
use bwshaper::config::{load_config, ConfigWatcher, ServerConfig};
use bwshaper::http::HttpServer;
use bwshaper::lifecycle::{wait_for_signal, Shutdown};
use bwshaper::net::ShapedListener;
use bwshaper::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "bwshaper")]
#[command(about = "HTTP download server with bandwidth shaping", long_about = None)]
struct Args {
    /// TOML configuration file; watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!("bwshaper v{} starting", env!("CARGO_PKG_VERSION"));

    let limits = config.shaping.limits()?;
    tracing::info!(
        bind_address = %config.listener.bind_address,
        aggregate_limit = limits.aggregate(),
        conn_limit = limits.conn(),
        payload_bytes = config.payload.size_bytes,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = ShapedListener::bind(&config.listener.bind_address, limits).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    // Dropping the watcher handle stops reloads, so it lives until exit.
    let (_watcher, config_updates) = match &args.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), rx)
        }
        None => (None, mpsc::unbounded_channel().1),
    };

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config.clone(), listener.shaper().clone());

    let admin_task = if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = server.state();
        let rx = shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_listener, state, rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    let mut server_task = tokio::spawn(server.run(listener, config_updates, shutdown.subscribe()));

    let result = tokio::select! {
        res = &mut server_task => res,
        _ = wait_for_signal() => {
            tracing::info!("Shutting down, draining in-flight downloads");
            shutdown.trigger();
            server_task.await
        }
    };
    shutdown.trigger();

    if let Some(task) = admin_task {
        let _ = task.await;
    }

    result??;
    tracing::info!("Shutdown complete");
    Ok(())
}
