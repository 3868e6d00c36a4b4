// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mutable-tree adapter: a writable, path-addressed tree over
//! content-addressed blocks.
//!
//! The tree is logically addressed by path; every operation re-resolves the
//! reference's trail against the shared root, so sibling references bound to
//! the same root always observe each other's mutations. Roots are
//! reference-counted; when the last reference closes, the tree is flushed
//! into the content store (and published through its key, when bound to one).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attr;
use crate::context::{FsScope, OpScope, bounded};
use crate::error::{FsError, FsResult};
use crate::resolver::{ContentResolver, NodeInfo};
use crate::stream::{DirectoryStream, VecSource};
use crate::types::{
    Cid, DirectoryEntry, FsConfig, NodeKind, OpenFlags, Qid, QidSalt, Stat, StatMask,
};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

use super::CoreBase;
use super::keyfs::RootTable;

/// One node of the in-memory tree.
#[derive(Clone, Debug)]
pub(crate) enum MfsNode {
    Dir(BTreeMap<String, MfsNode>),
    File(Vec<u8>),
    Symlink(String),
}

impl MfsNode {
    fn kind(&self) -> NodeKind {
        match self {
            MfsNode::Dir(_) => NodeKind::Directory,
            MfsNode::File(_) => NodeKind::File,
            MfsNode::Symlink(_) => NodeKind::Symlink,
        }
    }

    fn size(&self) -> u64 {
        match self {
            MfsNode::File(data) => data.len() as u64,
            _ => 0,
        }
    }
}

fn node_at<'a>(root: &'a MfsNode, trail: &[String]) -> FsResult<&'a MfsNode> {
    let mut cur = root;
    for name in trail {
        match cur {
            MfsNode::Dir(children) => {
                cur = children.get(name).ok_or(FsError::NotFound)?;
            }
            _ => return Err(FsError::NotADirectory),
        }
    }
    Ok(cur)
}

fn node_at_mut<'a>(root: &'a mut MfsNode, trail: &[String]) -> FsResult<&'a mut MfsNode> {
    let mut cur = root;
    for name in trail {
        match cur {
            MfsNode::Dir(children) => {
                cur = children.get_mut(name).ok_or(FsError::NotFound)?;
            }
            _ => return Err(FsError::NotADirectory),
        }
    }
    Ok(cur)
}

fn dir_at_mut<'a>(
    root: &'a mut MfsNode,
    trail: &[String],
) -> FsResult<&'a mut BTreeMap<String, MfsNode>> {
    match node_at_mut(root, trail)? {
        MfsNode::Dir(children) => Ok(children),
        _ => Err(FsError::NotADirectory),
    }
}

/// Shared state for one mutable tree root.
pub struct MfsShared {
    resolver: Arc<dyn ContentResolver>,
    /// Key published on flush; `None` for the bare files root.
    key: Option<String>,
    /// Distinguishes QID spaces of independent roots within one process.
    label: String,
    /// Per-call resolver timeout, inherited from the attaching config.
    timeout: Duration,
    tree: Mutex<MfsNode>,
    refs: StdMutex<usize>,
    dirty: AtomicBool,
}

impl MfsShared {
    /// Fresh, empty tree.
    pub fn empty(
        resolver: Arc<dyn ContentResolver>,
        key: Option<String>,
        label: &str,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            key,
            label: label.to_string(),
            timeout,
            tree: Mutex::new(MfsNode::Dir(BTreeMap::new())),
            refs: StdMutex::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    /// Materialize a tree from existing content at `target` ( `/ipfs/...` ).
    pub async fn load(
        resolver: Arc<dyn ContentResolver>,
        key: Option<String>,
        label: &str,
        target: &str,
        op: &OpScope,
        timeout: Duration,
    ) -> FsResult<Arc<Self>> {
        let root = load_node(&resolver, target, op, timeout).await?;
        let root = match root {
            MfsNode::Dir(_) => root,
            // A key may point at a bare file; wrap it so the root is a dir.
            other => {
                let mut children = BTreeMap::new();
                children.insert("data".to_string(), other);
                MfsNode::Dir(children)
            }
        };
        Ok(Arc::new(Self {
            resolver,
            key: key.clone(),
            label: label.to_string(),
            timeout,
            tree: Mutex::new(root),
            refs: StdMutex::new(0),
            dirty: AtomicBool::new(false),
        }))
    }

    fn retain(&self) {
        *self.refs.lock().unwrap() += 1;
    }

    /// Drop one reference; true when this was the last.
    fn release(&self) -> bool {
        let mut refs = self.refs.lock().unwrap();
        *refs = refs.saturating_sub(1);
        *refs == 0
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Write the tree into the content store and republish the key.
    /// No-op while clean.
    pub async fn flush(&self, op: &OpScope) -> FsResult<Option<Cid>> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let snapshot = self.tree.lock().await.clone();
        let cid = flush_node(&self.resolver, &snapshot, op, self.timeout).await?;
        if let Some(key) = &self.key {
            let target = format!("/ipfs/{cid}");
            bounded(op, self.timeout, self.resolver.publish(key, &target))
                .await
                .map_err(|e| e.at("publish", &target))?;
            debug!(key = %key, cid = %cid, "republished key after flush");
        }
        Ok(Some(cid))
    }
}

/// Recursively materialize content into tree nodes. Every resolver crossing
/// is bounded by the caller's scope and the per-call timeout.
fn load_node<'a>(
    resolver: &'a Arc<dyn ContentResolver>,
    path: &'a str,
    op: &'a OpScope,
    timeout: Duration,
) -> Pin<Box<dyn Future<Output = FsResult<MfsNode>> + Send + 'a>> {
    Box::pin(async move {
        let info = bounded(op, timeout, resolver.resolve_node(path))
            .await
            .map_err(|e| e.at("resolve", path))?;
        match info.kind {
            NodeKind::Symlink => Ok(MfsNode::Symlink(info.target.unwrap_or_default())),
            NodeKind::File => {
                let mut file = bounded(op, timeout, resolver.get(path))
                    .await
                    .map_err(|e| e.at("get", path))?;
                let mut data = vec![0u8; file.size() as usize];
                let mut filled = 0;
                while filled < data.len() {
                    let n = file.read_at(filled as u64, &mut data[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                data.truncate(filled);
                Ok(MfsNode::File(data))
            }
            NodeKind::Directory => {
                let mut rx = bounded(op, timeout, resolver.ls(path))
                    .await
                    .map_err(|e| e.at("ls", path))?;
                let mut children = BTreeMap::new();
                loop {
                    let item = bounded(op, timeout, async { Ok(rx.recv().await) })
                        .await
                        .map_err(|e| e.at("ls", path))?;
                    let Some(item) = item else { break };
                    let child = item.map_err(|e| e.at("ls", path))?;
                    let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name);
                    children.insert(child.name, load_node(resolver, &child_path, op, timeout).await?);
                }
                Ok(MfsNode::Dir(children))
            }
        }
    })
}

/// Recursively write a tree into the store, returning the node's identifier.
/// Directories serialize to a small manifest of `kind name cid` lines.
fn flush_node<'a>(
    resolver: &'a Arc<dyn ContentResolver>,
    node: &'a MfsNode,
    op: &'a OpScope,
    timeout: Duration,
) -> Pin<Box<dyn Future<Output = FsResult<Cid>> + Send + 'a>> {
    Box::pin(async move {
        match node {
            MfsNode::File(data) => bounded(op, timeout, resolver.add(NodeKind::File, data))
                .await
                .map_err(|e| e.at("add", "<file>")),
            MfsNode::Symlink(target) => {
                bounded(op, timeout, resolver.add(NodeKind::Symlink, target.as_bytes()))
                    .await
                    .map_err(|e| e.at("add", "<symlink>"))
            }
            MfsNode::Dir(children) => {
                let mut manifest = String::new();
                for (name, child) in children {
                    let cid = flush_node(resolver, child, op, timeout).await?;
                    let kind = match child.kind() {
                        NodeKind::Directory => 'd',
                        NodeKind::File => 'f',
                        NodeKind::Symlink => 'l',
                    };
                    manifest.push_str(&format!("{kind} {name} {cid}\n"));
                }
                bounded(op, timeout, resolver.add(NodeKind::Directory, manifest.as_bytes()))
                    .await
                    .map_err(|e| e.at("add", "<dir>"))
            }
        }
    })
}

/// Reference into a mutable tree.
pub struct FilesRef {
    base: CoreBase,
    shared: Arc<MfsShared>,
    /// Key-index table entry to evict when the last reference goes away.
    table: Option<(Arc<RootTable>, String)>,
    /// Open-file disposition; doubles as the handle for `check_walk`.
    flags: StdMutex<Option<OpenFlags>>,
}

impl FilesRef {
    /// Bind a fresh reference to an empty files root.
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        parent: &CancellationToken,
    ) -> FsResult<Self> {
        let fs = FsScope::attach(parent);
        let shared = MfsShared::empty(
            Arc::clone(&resolver),
            None,
            Namespace::Files.prefix(),
            config.call_timeout,
        );
        Self::attach_shared(resolver, config, salt, fs, None, shared, None)
    }

    pub(crate) fn attach_shared(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        fs: FsScope,
        parent: Option<Weak<dyn WalkRef>>,
        shared: Arc<MfsShared>,
        table: Option<(Arc<RootTable>, String)>,
    ) -> FsResult<Self> {
        shared.retain();
        Ok(Self {
            base: CoreBase::attach(resolver, config, Namespace::Files, salt, fs, parent)?,
            shared,
            table,
            flags: StdMutex::new(None),
        })
    }

    fn pseudo_cid(&self, kind: NodeKind) -> Cid {
        // Stable per logical location within one root; mutable nodes have no
        // content identifier until flushed.
        let _ = kind;
        Cid(format!("mfs:{}:/{}", self.shared.label, self.base.trail.join("/")))
    }

    async fn info(&self) -> FsResult<NodeInfo> {
        let tree = self.shared.tree.lock().await;
        let node = node_at(&tree, &self.base.trail)?;
        Ok(NodeInfo {
            cid: self.pseudo_cid(node.kind()),
            kind: node.kind(),
            size: node.size(),
            blocks: None,
            target: match node {
                MfsNode::Symlink(target) => Some(target.clone()),
                _ => None,
            },
        })
    }
}

#[async_trait]
impl WalkRef for FilesRef {
    fn namespace(&self) -> Namespace {
        Namespace::Files
    }

    async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
        let base = self.base.fork()?;
        self.shared.retain();
        Ok(Box::new(Self {
            base,
            shared: Arc::clone(&self.shared),
            table: self.table.clone(),
            flags: StdMutex::new(None),
        }))
    }

    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
        // A failed consuming step still discards this reference, so it must
        // give up its root count through close before the error surfaces.
        let checked = async {
            self.base.live()?;
            self.base.check_walk()?;
            let tree = self.shared.tree.lock().await;
            match node_at(&tree, &self.base.trail)? {
                MfsNode::Dir(children) if children.contains_key(name) => Ok(()),
                MfsNode::Dir(_) => Err(FsError::NotFound),
                _ => Err(FsError::NotADirectory),
            }
        }
        .await;
        if let Err(err) = checked {
            let _ = self.close().await;
            return Err(err);
        }
        let mut this = *self;
        this.base.trail.push(name.to_string());
        Ok(Box::new(this))
    }

    async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>> {
        if let Err(err) = self.base.live() {
            let _ = self.close().await;
            return Err(err);
        }
        let mut this = *self;
        if this.base.trail.pop().is_none() {
            if let Some(parent) = this.base.parent.as_ref().and_then(Weak::upgrade) {
                let forked = parent.fork().await;
                let _ = this.close().await;
                return forked;
            }
        }
        Ok(Box::new(this))
    }

    async fn qid(&self) -> FsResult<Qid> {
        self.base.live()?;
        if self.base.trail.is_empty() {
            return Ok(self.base.salt.synthetic_dir(&self.shared.label));
        }
        let info = self.info().await?;
        Ok(self.base.salt.qid_for(info.kind.into(), &info.cid))
    }

    fn check_walk(&self) -> FsResult<()> {
        self.base.check_walk()
    }

    fn trail(&self) -> Vec<String> {
        self.base.trail.clone()
    }

    fn device(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ("mutable-tree", self.shared.label.as_str()).hash(&mut hasher);
        hasher.finish()
    }

    fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    async fn close(&self) -> FsResult<()> {
        if !self.base.close().await {
            return Ok(());
        }
        *self.flags.lock().unwrap() = None;
        if self.shared.release() {
            // The reference's own scope was canceled just above; the final
            // flush runs under a fresh scope at the filesystem level.
            let flushed = match self.base.scope().and_then(|fs| fs.op_scope()) {
                Ok(op) => self.shared.flush(&op).await,
                Err(err) => Err(err),
            };
            if let Some((table, name)) = &self.table {
                table.evict(name);
            }
            if let Err(err) = flushed {
                warn!(error = %err, "flush on final close failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)> {
        self.base.live()?;
        let info = self.info().await?;
        Ok(attr::translate(&info, want, self.base.config.block_size))
    }

    async fn open(&self, flags: OpenFlags) -> FsResult<()> {
        self.base.live()?;
        {
            let mut tree = self.shared.tree.lock().await;
            let node = node_at_mut(&mut tree, &self.base.trail)?;
            match node {
                MfsNode::Dir(_) => return Err(FsError::IsADirectory),
                MfsNode::File(data) => {
                    if flags.truncate {
                        data.clear();
                        self.shared.mark_dirty();
                    }
                }
                MfsNode::Symlink(_) => return Err(FsError::InvalidOperation),
            }
        }
        *self.flags.lock().unwrap() = Some(flags);
        self.base.mark_open();
        Ok(())
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.base.live()?;
        match *self.flags.lock().unwrap() {
            Some(flags) if flags.read => {}
            _ => return Err(FsError::InvalidOperation),
        }
        let tree = self.shared.tree.lock().await;
        match node_at(&tree, &self.base.trail)? {
            MfsNode::File(data) => {
                let start = offset as usize;
                if start >= data.len() {
                    return Ok(0);
                }
                let end = (start + buf.len()).min(data.len());
                buf[..end - start].copy_from_slice(&data[start..end]);
                Ok(end - start)
            }
            _ => Err(FsError::IsADirectory),
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.base.live()?;
        match *self.flags.lock().unwrap() {
            Some(flags) if flags.write => {}
            _ => return Err(FsError::InvalidOperation),
        }
        let mut tree = self.shared.tree.lock().await;
        match node_at_mut(&mut tree, &self.base.trail)? {
            MfsNode::File(content) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > content.len() {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
                self.shared.mark_dirty();
                Ok(data.len())
            }
            _ => Err(FsError::IsADirectory),
        }
    }

    async fn opendir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let entries: Vec<DirectoryEntry> = {
            let tree = self.shared.tree.lock().await;
            let children = match node_at(&tree, &self.base.trail)? {
                MfsNode::Dir(children) => children,
                _ => return Err(FsError::NotADirectory),
            };
            children
                .iter()
                .map(|(name, node)| {
                    let mut trail = self.base.trail.clone();
                    trail.push(name.clone());
                    let cid = Cid(format!("mfs:{}:/{}", self.shared.label, trail.join("/")));
                    DirectoryEntry {
                        name: name.clone(),
                        offset: 0,
                        kind: node.kind(),
                        qid: self.base.salt.qid_for(node.kind().into(), &cid),
                    }
                })
                .collect()
        };
        let mut stream = DirectoryStream::new(
            Arc::new(VecSource::new(entries)),
            self.base.config.stream_depth,
        );
        stream.open(op.token())?;
        let mut guard = self.base.dir.lock().await;
        if guard.is_some() {
            return Err(FsError::AlreadyOpen);
        }
        *guard = Some(stream);
        self.base.mark_open();
        Ok(())
    }

    async fn readdir(&self, offset: u64, count: usize) -> FsResult<Vec<DirectoryEntry>> {
        self.base.live()?;
        let mut guard = self.base.dir.lock().await;
        let stream = guard.as_mut().ok_or(FsError::InvalidOperation)?;
        stream.read(offset, count).await
    }

    async fn rewinddir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let mut guard = self.base.dir.lock().await;
        let stream = guard.as_mut().ok_or(FsError::InvalidOperation)?;
        stream.reset(op.token())
    }

    async fn readlink(&self) -> FsResult<String> {
        self.base.live()?;
        let tree = self.shared.tree.lock().await;
        match node_at(&tree, &self.base.trail)? {
            MfsNode::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::InvalidOperation),
        }
    }

    async fn setattr_size(&self, size: u64) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        match node_at_mut(&mut tree, &self.base.trail)? {
            MfsNode::File(data) => {
                data.resize(size as usize, 0);
                self.shared.mark_dirty();
                Ok(())
            }
            MfsNode::Dir(_) => Err(FsError::IsADirectory),
            MfsNode::Symlink(_) => Err(FsError::InvalidOperation),
        }
    }

    async fn create(&self, name: &str) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        let children = dir_at_mut(&mut tree, &self.base.trail)?;
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        children.insert(name.to_string(), MfsNode::File(Vec::new()));
        self.shared.mark_dirty();
        Ok(())
    }

    async fn mkdir(&self, name: &str) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        let children = dir_at_mut(&mut tree, &self.base.trail)?;
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        children.insert(name.to_string(), MfsNode::Dir(BTreeMap::new()));
        self.shared.mark_dirty();
        Ok(())
    }

    async fn symlink(&self, name: &str, target: &str) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        let children = dir_at_mut(&mut tree, &self.base.trail)?;
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        children.insert(name.to_string(), MfsNode::Symlink(target.to_string()));
        self.shared.mark_dirty();
        Ok(())
    }

    async fn unlink(&self, name: &str, dir: bool) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        let children = dir_at_mut(&mut tree, &self.base.trail)?;
        match children.get(name) {
            None => return Err(FsError::NotFound),
            Some(MfsNode::Dir(grandchildren)) => {
                if !dir {
                    return Err(FsError::IsADirectory);
                }
                if !grandchildren.is_empty() {
                    return Err(FsError::DirectoryNotEmpty);
                }
            }
            Some(_) if dir => return Err(FsError::NotADirectory),
            Some(_) => {}
        }
        children.remove(name);
        self.shared.mark_dirty();
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_parent: &[String], new_name: &str) -> FsResult<()> {
        self.base.live()?;
        let mut tree = self.shared.tree.lock().await;
        {
            let children = dir_at_mut(&mut tree, &self.base.trail)?;
            if !children.contains_key(old_name) {
                return Err(FsError::NotFound);
            }
        }
        if new_parent == self.base.trail.as_slice() && new_name == old_name {
            return Ok(());
        }
        // The destination parent must not sit at or beneath the entry being
        // moved; the subtree would otherwise detach from the tree.
        if new_parent.len() > self.base.trail.len()
            && new_parent[..self.base.trail.len()] == self.base.trail[..]
            && new_parent[self.base.trail.len()] == old_name
        {
            return Err(FsError::RenameCycle);
        }
        {
            let dest = dir_at_mut(&mut tree, new_parent)?;
            if let Some(MfsNode::Dir(existing)) = dest.get(new_name) {
                if !existing.is_empty() {
                    return Err(FsError::DirectoryNotEmpty);
                }
            }
        }
        let source = {
            let children = dir_at_mut(&mut tree, &self.base.trail)?;
            children.remove(old_name).ok_or(FsError::NotFound)?
        };
        let dest = dir_at_mut(&mut tree, new_parent)?;
        dest.insert(new_name.to_string(), source);
        self.shared.mark_dirty();
        Ok(())
    }
}

impl Drop for FilesRef {
    fn drop(&mut self) {
        if self.base.is_closed() {
            return;
        }
        // A reference dropped without close still holds its root count.
        if !self.shared.release() {
            return;
        }
        if let Some((table, name)) = &self.table {
            table.evict(name);
        }
        let shared = Arc::clone(&self.shared);
        let op = self.base.scope().and_then(|fs| fs.op_scope());
        match (tokio::runtime::Handle::try_current(), op) {
            (Ok(handle), Ok(op)) => {
                handle.spawn(async move {
                    if let Err(err) = shared.flush(&op).await {
                        warn!(error = %err, "flush after dropped tree reference failed");
                    }
                });
            }
            _ => warn!("last tree reference dropped outside its scope; flush skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_resolver::MockResolver;
    use crate::walkref::walk;

    fn attach_empty() -> (FilesRef, Arc<MockResolver>, CancellationToken) {
        let resolver = Arc::new(MockResolver::new());
        let token = CancellationToken::new();
        let root = FilesRef::attach(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            FsConfig::default(),
            QidSalt::generate(),
            &token,
        )
        .unwrap();
        (root, resolver, token)
    }

    #[tokio::test]
    async fn create_write_and_read_through_sibling_reference() {
        let (root, _resolver, _token) = attach_empty();
        root.create("f").await.unwrap();
        let (_, result) = walk(&root, &["f"]).await;
        let writer = result.unwrap();
        writer
            .open(OpenFlags {
                read: false,
                write: true,
                truncate: false,
            })
            .await
            .unwrap();
        writer.write_at(0, b"shared bytes").await.unwrap();

        // Second, independently forked reference to the same root.
        let (_, result) = walk(&root, &["f"]).await;
        let reader = result.unwrap();
        reader.open(OpenFlags::READ).await.unwrap();
        let mut buf = [0u8; 32];
        let n = reader.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"shared bytes");
    }

    #[tokio::test]
    async fn mkdir_then_listing_reflects_children() {
        let (root, _resolver, _token) = attach_empty();
        root.mkdir("a").await.unwrap();
        root.create("z").await.unwrap();
        root.opendir().await.unwrap();
        let entries = root.readdir(0, 0).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert_eq!(entries[0].kind, NodeKind::Directory);
    }

    #[tokio::test]
    async fn unlink_semantics() {
        let (root, _resolver, _token) = attach_empty();
        root.mkdir("dir").await.unwrap();
        root.create("file").await.unwrap();
        let (_, result) = walk(&root, &["dir"]).await;
        let dir = result.unwrap();
        dir.create("inner").await.unwrap();

        assert!(matches!(
            root.unlink("dir", false).await,
            Err(FsError::IsADirectory)
        ));
        assert!(matches!(
            root.unlink("dir", true).await,
            Err(FsError::DirectoryNotEmpty)
        ));
        assert!(matches!(
            root.unlink("file", true).await,
            Err(FsError::NotADirectory)
        ));

        dir.unlink("inner", false).await.unwrap();
        root.unlink("dir", true).await.unwrap();
        root.unlink("file", false).await.unwrap();
        assert!(matches!(
            root.unlink("file", false).await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn truncate_via_setattr() {
        let (root, _resolver, _token) = attach_empty();
        root.create("f").await.unwrap();
        let (_, result) = walk(&root, &["f"]).await;
        let file = result.unwrap();
        file.open(OpenFlags {
            read: true,
            write: true,
            truncate: false,
        })
        .await
        .unwrap();
        file.write_at(0, b"0123456789").await.unwrap();
        file.setattr_size(4).await.unwrap();
        let (stat, _) = file.getattr(StatMask::ALL).await.unwrap();
        assert_eq!(stat.size, 4);
        let mut buf = [0u8; 16];
        let n = file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123");
    }

    #[tokio::test]
    async fn rename_moves_between_directories() {
        let (root, _resolver, _token) = attach_empty();
        root.mkdir("src").await.unwrap();
        root.mkdir("dst").await.unwrap();
        let (_, result) = walk(&root, &["src"]).await;
        let src = result.unwrap();
        src.create("f").await.unwrap();
        src.rename("f", &["dst".to_string()], "g").await.unwrap();

        let (qids, moved) = walk(&root, &["dst", "g"]).await;
        assert_eq!(qids.len(), 2);
        moved.unwrap();
        let (_, gone) = walk(&root, &["src", "f"]).await;
        assert!(gone.is_err());
    }

    #[tokio::test]
    async fn rename_to_the_same_name_is_a_no_op() {
        let (root, _resolver, _token) = attach_empty();
        root.create("f").await.unwrap();
        root.rename("f", &[], "f").await.unwrap();
        let (_, kept) = walk(&root, &["f"]).await;
        kept.unwrap().close().await.unwrap();
        assert!(matches!(
            root.rename("missing", &[], "missing").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn rename_into_own_subtree_is_rejected() {
        let (root, _resolver, _token) = attach_empty();
        root.mkdir("a").await.unwrap();
        let (_, sub) = walk(&root, &["a"]).await;
        let sub = sub.unwrap();
        sub.mkdir("b").await.unwrap();

        assert!(matches!(
            root.rename("a", &["a".to_string()], "c").await,
            Err(FsError::RenameCycle)
        ));
        assert!(matches!(
            root.rename("a", &["a".to_string(), "b".to_string()], "c").await,
            Err(FsError::RenameCycle)
        ));

        // Rejected moves leave the tree untouched.
        let (_, intact) = walk(&root, &["a", "b"]).await;
        intact.unwrap().close().await.unwrap();
        sub.close().await.unwrap();
    }

    #[tokio::test]
    async fn final_close_flushes_and_publishes() {
        let resolver = Arc::new(MockResolver::new());
        let token = CancellationToken::new();
        let shared = MfsShared::empty(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            Some("mykey".to_string()),
            "test-root",
            FsConfig::default().call_timeout,
        );
        let fs = FsScope::attach(&token);
        let root = FilesRef::attach_shared(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            FsConfig::default(),
            QidSalt::generate(),
            fs,
            None,
            shared,
            None,
        )
        .unwrap();

        root.create("f").await.unwrap();
        let (_, result) = walk(&root, &["f"]).await;
        let file = result.unwrap();
        file.open(OpenFlags {
            read: false,
            write: true,
            truncate: false,
        })
        .await
        .unwrap();
        file.write_at(0, b"published content").await.unwrap();

        // Not the last reference yet: no publish.
        file.close().await.unwrap();
        assert!(resolver.published_target("mykey").is_none());

        root.close().await.unwrap();
        let target = resolver.published_target("mykey").expect("key published");
        assert!(target.starts_with("/ipfs/"));
    }

    #[tokio::test]
    async fn failed_walk_still_allows_final_publish() {
        let resolver = Arc::new(MockResolver::new());
        let token = CancellationToken::new();
        let shared = MfsShared::empty(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            Some("mykey".to_string()),
            "test-root",
            FsConfig::default().call_timeout,
        );
        let fs = FsScope::attach(&token);
        let root = FilesRef::attach_shared(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            FsConfig::default(),
            QidSalt::generate(),
            fs,
            None,
            shared,
            None,
        )
        .unwrap();
        root.create("f").await.unwrap();

        // The forked reference behind this dead-end lookup must give its
        // root count back.
        let (_, missing) = walk(&root, &["nope"]).await;
        assert!(matches!(missing.err().unwrap().kind(), FsError::NotFound));

        root.close().await.unwrap();
        let target = resolver.published_target("mykey").expect("key published");
        assert!(target.starts_with("/ipfs/"));
    }

    #[tokio::test]
    async fn load_materializes_existing_content() {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_dir("/ipfs/QmTree");
        resolver.add_file("/ipfs/QmTree/notes", b"existing");
        let token = CancellationToken::new();
        let fs = FsScope::attach(&token);
        let op = fs.op_scope().unwrap();
        let shared = MfsShared::load(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            None,
            "loaded",
            "/ipfs/QmTree",
            &op,
            FsConfig::default().call_timeout,
        )
        .await
        .unwrap();
        let root = FilesRef::attach_shared(
            Arc::clone(&resolver) as Arc<dyn ContentResolver>,
            FsConfig::default(),
            QidSalt::generate(),
            fs,
            None,
            shared,
            None,
        )
        .unwrap();
        let (_, result) = walk(&root, &["notes"]).await;
        let file = result.unwrap();
        file.open(OpenFlags::READ).await.unwrap();
        let mut buf = [0u8; 16];
        let n = file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"existing");
    }
}
