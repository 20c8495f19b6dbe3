// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::signal::unix::{SignalKind, signal};

use squash_api::{AttachmentStore, MemoryStore};
use squash_controller::grpc;
use squash_controller::launcher::{AgentLauncher, ProcessLauncher};
use squash_controller::reconciler::Reconciler;

#[derive(Parser, Debug)]
#[command(name = "squashd", about = "Squash attachment store and reconciler")]
struct Cli {
    /// Unix socket to serve the attachment store on
    #[arg(long, default_value = squash_api::DEFAULT_STORE_SOCKET)]
    socket: PathBuf,

    /// Agent binary launched per attachment
    #[arg(long, default_value = "squash-agent")]
    agent_binary: PathBuf,

    /// Directory for per-agent log files
    #[arg(long, default_value = "/var/log/squash")]
    log_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level)?;

    let store: Arc<dyn AttachmentStore> = Arc::new(MemoryStore::new());
    let launcher: Arc<dyn AgentLauncher> = Arc::new(ProcessLauncher::new(
        cli.agent_binary,
        cli.socket.clone(),
        cli.log_dir,
    ));

    let reconciler = Arc::new(Reconciler::new(store.clone(), launcher));
    let watcher = reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            error!("reconciler stopped: {e}");
        }
    });

    info!("squashd starting on {}", cli.socket.display());
    grpc::serve_on_unix_socket(&cli.socket, store, shutdown_signal()).await
}

async fn shutdown_signal() {
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return std::future::pending().await;
    };
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}
