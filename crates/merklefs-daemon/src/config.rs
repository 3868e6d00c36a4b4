// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration: the store location plus the mount targets to
//! supervise, each written in the stacked mount-point encoding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use merklefs_proto::MountPoint;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    store: PathBuf,
    mounts: Vec<String>,
}

/// Parsed daemon configuration.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Root of the on-disk content store, shared by every mount.
    pub store: PathBuf,
    pub mounts: Vec<MountPoint>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw: RawConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        let mounts = raw
            .mounts
            .iter()
            .map(|m| {
                m.parse::<MountPoint>()
                    .with_context(|| format!("bad mount point {m:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            store: raw.store,
            mounts,
        })
    }
}
