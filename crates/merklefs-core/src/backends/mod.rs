// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend adapters wiring backend-specific lookup/listing/creation
//! semantics into the `WalkRef` contract and the directory stream.

pub mod ipfs;
pub mod ipns;
pub mod keyfs;
pub mod mfs;
pub mod overlay;
pub mod pinfs;

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::context::{FsScope, OpScope, bounded};
use crate::error::{FsError, FsResult};
use crate::resolver::{ContentFile, ContentResolver, NodeInfo};
use crate::stream::DirectoryStream;
use crate::types::{FsConfig, QidSalt};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

/// State common to every backend reference: the trail, the resolver handle,
/// the namespace prefix, the context pair, and handle slots.
pub(crate) struct CoreBase {
    pub resolver: Arc<dyn ContentResolver>,
    pub config: FsConfig,
    pub ns: Namespace,
    pub salt: QidSalt,
    pub trail: Vec<String>,
    /// Back-reference used only for `..` at the backend root; set once at
    /// construction. Weak so the overlay/subsystem linkage cannot leak.
    pub parent: Option<Weak<dyn WalkRef>>,
    fs: Option<FsScope>,
    op: Option<OpScope>,
    closed: AtomicBool,
    /// Sync mirror of "some handle is open", consulted by `check_walk`.
    handle_open: AtomicBool,
    pub dir: Mutex<Option<DirectoryStream>>,
    pub file: Mutex<Option<Box<dyn ContentFile>>>,
}

impl CoreBase {
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        ns: Namespace,
        salt: QidSalt,
        fs: FsScope,
        parent: Option<Weak<dyn WalkRef>>,
    ) -> FsResult<Self> {
        let op = fs.op_scope()?;
        Ok(Self {
            resolver,
            config,
            ns,
            salt,
            trail: Vec::new(),
            parent,
            fs: Some(fs),
            op: Some(op),
            closed: AtomicBool::new(false),
            handle_open: AtomicBool::new(false),
            dir: Mutex::new(None),
            file: Mutex::new(None),
        })
    }

    /// A parallel base: same trail and backend root, fresh operation scope,
    /// no handles.
    pub fn fork(&self) -> FsResult<Self> {
        if self.is_closed() {
            return Err(FsError::Closed);
        }
        let fs = self.fs.as_ref().ok_or(FsError::NotInitialized)?;
        let op = fs.op_scope()?;
        Ok(Self {
            resolver: Arc::clone(&self.resolver),
            config: self.config.clone(),
            ns: self.ns,
            salt: self.salt,
            trail: self.trail.clone(),
            parent: self.parent.clone(),
            fs: Some(fs.clone()),
            op: Some(op),
            closed: AtomicBool::new(false),
            handle_open: AtomicBool::new(false),
            dir: Mutex::new(None),
            file: Mutex::new(None),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The filesystem scope this reference belongs to.
    pub fn scope(&self) -> FsResult<FsScope> {
        self.fs.clone().ok_or(FsError::NotInitialized)
    }

    pub fn live(&self) -> FsResult<&OpScope> {
        if self.is_closed() {
            return Err(FsError::Closed);
        }
        let op = self.op.as_ref().ok_or(FsError::NotInitialized)?;
        if op.is_cancelled() {
            return Err(FsError::Canceled);
        }
        Ok(op)
    }

    pub fn check_walk(&self) -> FsResult<()> {
        if self.handle_open.load(Ordering::SeqCst) {
            return Err(FsError::FileOpen);
        }
        Ok(())
    }

    pub fn mark_open(&self) {
        self.handle_open.store(true, Ordering::SeqCst);
    }

    pub fn handle_is_open(&self) -> bool {
        self.handle_open.load(Ordering::SeqCst)
    }

    /// Abstract path for the current trail, e.g. `/ipfs/Qm.../dir/file`.
    pub fn full_path(&self) -> String {
        if self.trail.is_empty() {
            self.ns.prefix().to_string()
        } else {
            format!("{}/{}", self.ns.prefix(), self.trail.join("/"))
        }
    }

    /// Path for the trail extended by one component, without mutating.
    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.full_path().trim_end_matches('/'), name)
    }

    /// Resolve the current trail through the content resolver, bounded by
    /// the per-call timeout.
    pub async fn resolve(&self) -> FsResult<NodeInfo> {
        self.resolve_path(&self.full_path()).await
    }

    pub async fn resolve_path(&self, path: &str) -> FsResult<NodeInfo> {
        let op = self.live()?;
        bounded(op, self.config.call_timeout, self.resolver.resolve_node(path))
            .await
            .map_err(|e| e.at("resolve", path))
    }

    /// Tear down the reference. Idempotent: the second close is a no-op.
    /// Returns true when this call performed the transition.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(op) = self.op.as_ref() {
            op.cancel();
        }
        self.handle_open.store(false, Ordering::SeqCst);
        *self.dir.lock().await = None;
        *self.file.lock().await = None;
        true
    }
}
