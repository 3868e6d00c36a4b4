// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content Resolver capability.
//!
//! The underlying content-addressed object store is an external collaborator;
//! this trait is its interface boundary. Backends call through it for every
//! resolve/read/list/ingest and must never assume anything about transport or
//! encoding behind it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::FsResult;
use crate::types::{Cid, NodeKind};

/// A resolved node's metadata as reported by the store.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub cid: Cid,
    pub kind: NodeKind,
    /// UnixFS cumulative size for files, 0 for directories unless known.
    pub size: u64,
    /// Number of underlying blocks, when the store reports it.
    pub blocks: Option<u64>,
    /// Symlink target, present only for `NodeKind::Symlink`.
    pub target: Option<String>,
}

/// One child produced by a directory listing.
#[derive(Clone, Debug)]
pub struct ChildEntry {
    pub name: String,
    pub cid: Cid,
    pub kind: NodeKind,
    pub size: u64,
}

/// A named signing key known to the node.
#[derive(Clone, Debug)]
pub struct KeyInfo {
    pub name: String,
    /// Path the key currently points at, e.g. `/ipfs/Qm...`.
    pub target: String,
}

/// Open read handle over a file's content.
pub trait ContentFile: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn size(&self) -> u64;
}

/// Read/resolve/list/ingest capability over the content-addressed store.
///
/// Every method may block on network or disk I/O; callers bound each call
/// with the per-call timeout from their operation scope.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Resolve an abstract path (`/ipfs/...`, `/ipns/...`) to node metadata.
    async fn resolve_node(&self, path: &str) -> FsResult<NodeInfo>;

    /// Open a file's content for reading.
    async fn get(&self, path: &str) -> FsResult<Box<dyn ContentFile>>;

    /// Enumerate a directory's children. Entries arrive in store order on
    /// the returned channel; an `Err` item is terminal.
    async fn ls(&self, path: &str) -> FsResult<mpsc::Receiver<FsResult<ChildEntry>>>;

    /// Ingest one encoded node, returning its new identifier. `kind` tells
    /// the store how to interpret `data`: file bytes, a symlink target, or
    /// a serialized directory listing.
    async fn add(&self, kind: NodeKind, data: &[u8]) -> FsResult<Cid>;

    /// Point `key` at `target` (used when flushing a key-bound mutable tree).
    async fn publish(&self, key: &str, target: &str) -> FsResult<()>;

    /// Currently pinned roots.
    async fn list_pins(&self) -> FsResult<Vec<Cid>>;

    /// Locally held signing keys.
    async fn list_keys(&self) -> FsResult<Vec<KeyInfo>>;
}
