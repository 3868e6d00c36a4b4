// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MerkleFS FUSE Host — mounts a content-addressed namespace via libfuse.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
#[cfg(not(all(feature = "fuse", target_os = "linux")))]
use tracing::warn;

use merklefs_core::types::FsConfig;
use merklefs_proto::Namespace;

#[derive(Parser)]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Directory holding the on-disk content store
    #[arg(short, long, default_value = ".merklefs")]
    store: PathBuf,

    /// Namespace to mount: overlay, ipfs, ipns, file, pinfs, keyfs
    #[arg(short, long, default_value = "overlay")]
    namespace: String,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

/// On-disk configuration shape; everything is optional and falls back to
/// the engine defaults.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HostConfig {
    block_size: u32,
    call_timeout_secs: u64,
    stream_depth: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        let base = FsConfig::default();
        Self {
            block_size: base.block_size,
            call_timeout_secs: base.call_timeout.as_secs(),
            stream_depth: base.stream_depth,
        }
    }
}

impl From<HostConfig> for FsConfig {
    fn from(host: HostConfig) -> Self {
        FsConfig {
            block_size: host.block_size,
            call_timeout: Duration::from_secs(host.call_timeout_secs),
            stream_depth: host.stream_depth,
        }
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    let host = match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<HostConfig>(&content)?
        }
        None => HostConfig::default(),
    };
    Ok(host.into())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = load_config(args.config)?;
    let namespace: Namespace = args
        .namespace
        .parse()
        .map_err(|e| anyhow!("bad --namespace: {e}"))?;

    info!(
        mount_point = %args.mount_point.display(),
        store = %args.store.display(),
        namespace = namespace.name(),
        "starting MerkleFS FUSE host"
    );

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        use std::sync::Arc;

        let resolver = Arc::new(merklefs_core::DiskResolver::open(&args.store)?);
        let filesystem = adapter::MerkleFuse::new(resolver, config, namespace)?;

        let mut mount_options = vec![
            fuser::MountOption::FSName("merklefs".to_string()),
            fuser::MountOption::Subtype("merklefs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }
        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)?;
        info!("mounted; blocking until unmount");
        session.join();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        warn!("FUSE support not compiled in; compile with --features fuse on Linux");
        info!(config = ?config, "configuration parsed successfully");
    }

    Ok(())
}
