// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-spawning mounter: each FUSE target runs as its own host
//! process, so a crashed mount never takes the supervisor down with it.
//! 9P targets need a wire listener in front of the session layer and are
//! not spawned from here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use merklefs_proto::{HostApi, HostRegistry, MountPoint, Target};

use crate::supervisor::Mounter;

/// Grace period after spawn before the child is considered up.
const SPAWN_SETTLE: Duration = Duration::from_millis(200);

pub struct ProcessMounter {
    store: PathBuf,
    registry: HostRegistry,
    /// Host binary for FUSE targets; next to our own executable by default.
    fuse_host: PathBuf,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessMounter {
    pub fn new(store: PathBuf, registry: HostRegistry) -> Result<Self> {
        let fuse_host = std::env::current_exe()
            .context("locating own executable")?
            .with_file_name("merklefs-fuse-host");
        Ok(Self {
            store,
            registry,
            fuse_host,
            children: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_fuse_host(mut self, path: PathBuf) -> Self {
        self.fuse_host = path;
        self
    }
}

#[async_trait]
impl Mounter for ProcessMounter {
    async fn mount(&self, point: &MountPoint) -> Result<()> {
        if self.registry.by_name(point.api.name()).is_none() {
            bail!("host api {} not registered", point.api);
        }
        match (point.api, &point.target) {
            (HostApi::Fuse, Target::Path(path)) => {
                let mut child = Command::new(&self.fuse_host)
                    .arg(path)
                    .arg("--store")
                    .arg(&self.store)
                    .arg("--namespace")
                    .arg(point.namespace.name())
                    .arg("--auto-unmount")
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .with_context(|| {
                        format!("spawning {} for {point}", self.fuse_host.display())
                    })?;
                tokio::time::sleep(SPAWN_SETTLE).await;
                if let Some(status) = child.try_wait()? {
                    bail!("fuse host for {point} exited immediately: {status}");
                }
                debug!(mount = %point, pid = ?child.id(), "fuse host running");
                self.children.lock().unwrap().insert(point.to_string(), child);
                Ok(())
            }
            (HostApi::Fuse, other) => {
                Err(anyhow!("fuse mounts need a path target, got {other:?}"))
            }
            (HostApi::NineP, _) => Err(anyhow!(
                "9p targets are served by an external listener, not this daemon"
            )),
        }
    }

    async fn unmount(&self, point: &MountPoint) -> Result<()> {
        let child = self.children.lock().unwrap().remove(&point.to_string());
        let Some(mut child) = child else {
            warn!(mount = %point, "unmount of a target that is not up");
            return Ok(());
        };
        // The host was spawned with auto-unmount; ending the process
        // releases the kernel mount.
        child.start_kill().context("signaling fuse host")?;
        let status = child.wait().await.context("waiting for fuse host exit")?;
        debug!(mount = %point, %status, "fuse host stopped");
        Ok(())
    }
}
