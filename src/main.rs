//! Edgegate server
//!
//! Serves the environment proxy API and the tunnel endpoint edge agents dial
//! into, and keeps environment status fresh with periodic snapshots.

mod api;
mod config;
mod context;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, Cli};
use crate::context::AppContext;

/// Setup logging; `RUST_LOG` overrides the default level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = AppConfig::from_cli(&cli)?;

    info!(
        "Edgegate {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );
    info!("API: {}", config.api_bind);
    info!("Tunnel server: {}", config.tunnel.bind_addr);
    info!(
        "Snapshots every {:?} ({} workers, probe timeout {:?})",
        config.snapshot.interval, config.snapshot.workers, config.snapshot.probe_timeout
    );

    let ctx = Arc::new(AppContext::in_memory(config));
    ctx.bootstrap_primary().await?;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(ctx.clone().run(shutdown.clone()));

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            true
        }
        result = &mut server => {
            result??;
            false
        }
    };

    if interrupted {
        info!("Received Ctrl+C, shutting down...");
        shutdown.cancel();
        server.await??;
    }

    info!("Edgegate stopped");
    Ok(())
}
