//! oxidisk-engined - privileged Disk Operations Engine
//!
//! Mediates every destructive or long-running operation against block
//! devices on behalf of the Oxidisk desktop shell: topology discovery,
//! preflight safety checks, partition lifecycle, crash-safe moves and
//! copies, image flashing and backup with verification.

mod battery;
mod bus;
mod config;
mod dispatch;
mod inspect;
mod ipc;
mod journal;
mod ops;
mod preflight;
mod scan;
mod sidecar;
mod sudoers;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::ipc::IpcServer;

/// Oxidisk Disk Operations Engine
#[derive(Parser, Debug)]
#[command(name = "oxidisk-engined", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/oxidisk/engine.yaml")]
    config: PathBuf,

    /// Socket path (overrides the configuration)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("oxidisk-engined v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::load(&args.config)?;
    if let Some(socket) = args.socket {
        config.paths.socket = socket;
    }
    let config = Arc::new(config);

    let dispatcher = Arc::new(Dispatcher::new(config.clone())?);

    // An interrupted byte copy from a previous run is surfaced here and
    // left in place; the UI decides between Ignore and Repair.
    if let Some(record) = dispatcher.startup() {
        warn!(
            "previous {} on {} was interrupted at {} of {} bytes",
            record.operation.as_str(),
            record.device,
            record.last_copied,
            record.size
        );
    }

    let server = IpcServer::new(config.paths.socket.clone(), dispatcher);
    info!("engine ready");
    server.run().await
}
