// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount supervision with partial-failure unwind.
//!
//! Mount targets come up in configuration order. If one fails, everything
//! already mounted comes down again in reverse order; unwind failures are
//! logged and never mask the error that started the unwind.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use merklefs_proto::MountPoint;

/// How mounts are actually brought up and torn down. The supervisor only
/// sequences; the mounter owns the mechanism.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, point: &MountPoint) -> anyhow::Result<()>;
    async fn unmount(&self, point: &MountPoint) -> anyhow::Result<()>;
}

pub struct Supervisor<M: Mounter> {
    mounter: M,
    shutdown: CancellationToken,
    /// Mounts currently up, in the order they came up.
    active: Mutex<Vec<MountPoint>>,
}

impl<M: Mounter> Supervisor<M> {
    pub fn new(mounter: M, shutdown: CancellationToken) -> Self {
        Self {
            mounter,
            shutdown,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Bring every target up; on the first failure, unwind and report it.
    pub async fn mount_all(&self, points: &[MountPoint]) -> anyhow::Result<()> {
        for point in points {
            match self.mounter.mount(point).await {
                Ok(()) => {
                    info!(mount = %point, "mounted");
                    self.active.lock().unwrap().push(point.clone());
                }
                Err(err) => {
                    error!(mount = %point, error = %err, "mount failed; unwinding");
                    self.unwind().await;
                    return Err(err.context(format!("mounting {point}")));
                }
            }
        }
        Ok(())
    }

    /// Tear down everything that is up, newest first.
    pub async fn unwind(&self) {
        let up: Vec<MountPoint> = {
            let mut active = self.active.lock().unwrap();
            active.drain(..).rev().collect()
        };
        for point in up {
            match self.mounter.unmount(&point).await {
                Ok(()) => info!(mount = %point, "unmounted"),
                Err(err) => error!(mount = %point, error = %err, "unmount failed"),
            }
        }
    }

    /// Block until shutdown is requested, then unwind.
    pub async fn run(&self, points: &[MountPoint]) -> anyhow::Result<()> {
        self.mount_all(points).await?;
        self.shutdown.cancelled().await;
        info!("shutdown requested");
        self.unwind().await;
        Ok(())
    }
}
