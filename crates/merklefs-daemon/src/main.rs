// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MerkleFS daemon — supervises the configured set of mounts.

mod config;
mod mounter;
mod supervisor;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use merklefs_proto::HostRegistry;

use config::DaemonConfig;
use mounter::ProcessMounter;
use supervisor::Supervisor;

#[derive(Parser)]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, default_value = "merklefs-daemon.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = DaemonConfig::load(&args.config)?;
    info!(
        store = %config.store.display(),
        mounts = config.mounts.len(),
        "starting MerkleFS daemon"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let mounter = ProcessMounter::new(config.store.clone(), HostRegistry::standard())?;
    let supervisor = Supervisor::new(mounter, shutdown);
    supervisor.run(&config.mounts).await?;

    info!("all mounts released");
    Ok(())
}
