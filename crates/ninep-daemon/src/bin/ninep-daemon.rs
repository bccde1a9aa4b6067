// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ninep_core::{LocalBackend, MultiDevicePolicy, SecurityModel};
use ninep_daemon::{DaemonConfig, Listener, Overrides, Server};
use ninep_logging::CliLoggingArgs;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a host directory over 9P2000.L", long_about = None)]
struct Cli {
    /// Directory to export
    export: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, env = "NINEP_CONFIG")]
    config: Option<PathBuf>,

    /// Listen on a Unix socket
    #[arg(long, conflicts_with = "listen_tcp")]
    listen_unix: Option<PathBuf>,

    /// Listen on a TCP address (host:port)
    #[arg(long)]
    listen_tcp: Option<String>,

    /// Reject every request that would modify the export
    #[arg(long)]
    readonly: bool,

    /// Handling of exports spanning several devices (remap, forbid, warn)
    #[arg(long)]
    multidevs: Option<MultiDevicePolicy>,

    /// How client credentials map onto host files (passthrough, mapped-xattr, none)
    #[arg(long)]
    security_model: Option<SecurityModel>,

    /// Largest message size offered to clients
    #[arg(long)]
    msize: Option<u32>,

    /// Worker threads for blocking filesystem calls
    #[arg(long)]
    workers: Option<usize>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            export: self.export.clone(),
            listen_unix: self.listen_unix.clone(),
            listen_tcp: self.listen_tcp.clone(),
            readonly: self.readonly,
            multidevs: self.multidevs,
            security_model: self.security_model,
            msize: self.msize,
            workers: self.workers,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    config.apply(cli.overrides());

    cli.logging.clone().merge_config(&config.logging).init("ninep-daemon")?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.session.workers)
        .build()
        .context("failed to build the tokio runtime")?;

    let result = runtime.block_on(run(config));
    if let Err(err) = &result {
        error!(error = %err, "Daemon exited with an error");
    }
    result
}

async fn run(config: DaemonConfig) -> Result<()> {
    let export = config.export_path()?.to_path_buf();
    let backend = LocalBackend::new(&export, config.export.security_model)
        .with_context(|| format!("cannot export {}", export.display()))?;
    let listener = Listener::bind(&config.listen_addr()?).await?;

    info!(
        operation = "start_daemon",
        export = %export.display(),
        address = %listener.describe(),
        readonly = config.session_config().readonly,
        "Starting 9P daemon"
    );

    let server = Server::new(listener, Arc::new(backend), config.session_config());
    server.run(shutdown_signal()?).await?;
    Ok(())
}

fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, shutting down");
            }
        }
    })
}
