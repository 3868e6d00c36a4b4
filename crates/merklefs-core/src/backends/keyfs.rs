// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Key-index adapter: locally held signing keys as writable roots.
//!
//! The root lists the node's keys. Stepping to a key name yields a mutable
//! tree bound to that key, materialized from the key's current target and
//! republished when the last reference to it closes. All references to the
//! same key share one tree via the root table, so edits are visible across
//! references immediately. Names that are not local keys fall through to the
//! indirected namespace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attr;
use crate::context::FsScope;
use crate::error::{FsError, FsResult};
use crate::resolver::ContentResolver;
use crate::stream::{DirectoryStream, EntrySource, send_or_cancel};
use crate::types::{DirectoryEntry, FsConfig, Qid, QidSalt, Stat, StatMask};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

use super::CoreBase;
use super::ipfs::ImmutableRef;
use super::mfs::{FilesRef, MfsShared};

/// Shared roots, one per key currently held open by any reference.
///
/// The lock is plain std sync and never held across an await; loading a
/// tree happens outside it, and an insert race keeps the first winner.
pub(crate) struct RootTable {
    entries: StdMutex<HashMap<String, Arc<MfsShared>>>,
}

impl RootTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: StdMutex::new(HashMap::new()),
        })
    }

    fn get(&self, name: &str) -> Option<Arc<MfsShared>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    /// Keep the first root bound to a name; a racing load loses.
    fn insert_or_existing(&self, name: &str, shared: Arc<MfsShared>) -> Arc<MfsShared> {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(name.to_string()).or_insert(shared).clone()
    }

    /// Remove a root once its last reference has flushed.
    pub fn evict(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Reference to the key-index root.
pub struct KeyRef {
    base: CoreBase,
    /// Prototype indirected reference forked for non-key names.
    ipns: ImmutableRef,
    table: Arc<RootTable>,
}

impl KeyRef {
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        parent: &CancellationToken,
    ) -> FsResult<Self> {
        let fs = FsScope::attach(parent);
        Self::attach_scoped(resolver, config, salt, fs, None, RootTable::new())
    }

    pub(crate) fn attach_scoped(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        fs: FsScope,
        parent: Option<Weak<dyn WalkRef>>,
        table: Arc<RootTable>,
    ) -> FsResult<Self> {
        let ipns = super::ipns::attach_scoped(
            Arc::clone(&resolver),
            config.clone(),
            salt,
            fs.clone(),
            None,
        )?;
        Ok(Self {
            base: CoreBase::attach(resolver, config, Namespace::KeyFs, salt, fs, parent)?,
            ipns,
            table,
        })
    }

    /// Bind (or join) the shared mutable tree for one of our keys.
    async fn open_key_root(&self, name: &str, target: &str) -> FsResult<Box<dyn WalkRef>> {
        let shared = match self.table.get(name) {
            Some(shared) => shared,
            None => {
                let op = self.base.live()?;
                let label = format!("{}/{name}", Namespace::KeyFs.prefix());
                let loaded = MfsShared::load(
                    Arc::clone(&self.base.resolver),
                    Some(name.to_string()),
                    &label,
                    target,
                    op,
                    self.base.config.call_timeout,
                )
                .await?;
                self.table.insert_or_existing(name, loaded)
            }
        };
        debug!(key = %name, "opened key-bound tree");
        let fs = self.base.scope()?;
        let tree = FilesRef::attach_shared(
            Arc::clone(&self.base.resolver),
            self.base.config.clone(),
            self.base.salt,
            fs,
            None,
            shared,
            Some((Arc::clone(&self.table), name.to_string())),
        )?;
        Ok(Box::new(tree))
    }

    async fn step_inner(&self, name: &str) -> FsResult<Box<dyn WalkRef>> {
        let op = self.base.live()?;
        self.base.check_walk()?;
        let keys = crate::context::bounded(
            op,
            self.base.config.call_timeout,
            self.base.resolver.list_keys(),
        )
        .await
        .map_err(|e| e.at("list_keys", "/keyfs"))?;

        if let Some(key) = keys.into_iter().find(|k| k.name == name) {
            return self.open_key_root(&key.name, &key.target).await;
        }

        // Not one of ours: the name may still resolve through the
        // indirected namespace.
        let delegate = Box::new(self.ipns.fork_self()?);
        delegate.step(name).await
    }
}

/// Fetches the key set and resolves each target's type, streaming entries.
struct KeySource {
    resolver: Arc<dyn ContentResolver>,
    salt: QidSalt,
}

#[async_trait]
impl EntrySource for KeySource {
    async fn send_entries(
        &self,
        scope: CancellationToken,
        out: tokio::sync::mpsc::Sender<FsResult<DirectoryEntry>>,
    ) {
        let keys = tokio::select! {
            _ = scope.cancelled() => return,
            keys = self.resolver.list_keys() => keys,
        };
        let keys = match keys {
            Ok(keys) => keys,
            Err(err) => {
                let _ = send_or_cancel(&scope, &out, Err(err.at("list_keys", "/keyfs"))).await;
                return;
            }
        };
        for key in keys {
            let resolved = tokio::select! {
                _ = scope.cancelled() => return,
                resolved = self.resolver.resolve_node(&key.target) => resolved,
            };
            let item = match resolved {
                Ok(info) => Ok(DirectoryEntry {
                    name: key.name,
                    offset: 0,
                    kind: info.kind,
                    qid: self.salt.qid_for(info.kind.into(), &info.cid),
                }),
                Err(err) => Err(err.at("resolve", &key.target)),
            };
            let stop = item.is_err();
            if !send_or_cancel(&scope, &out, item).await || stop {
                return;
            }
        }
    }
}

#[async_trait]
impl WalkRef for KeyRef {
    fn namespace(&self) -> Namespace {
        Namespace::KeyFs
    }

    async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
        Ok(Box::new(Self {
            base: self.base.fork()?,
            ipns: self.ipns.fork_self()?,
            table: Arc::clone(&self.table),
        }))
    }

    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
        // Consuming semantics: this reference is spent whether or not the
        // step lands.
        let stepped = self.step_inner(name).await;
        let _ = self.close().await;
        stepped
    }

    async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>> {
        self.base.live()?;
        if let Some(parent) = self.base.parent.as_ref().and_then(Weak::upgrade) {
            let forked = parent.fork().await;
            let _ = self.close().await;
            return forked;
        }
        Ok(self)
    }

    async fn qid(&self) -> FsResult<Qid> {
        self.base.live()?;
        Ok(self.base.salt.synthetic_dir(Namespace::KeyFs.prefix()))
    }

    fn check_walk(&self) -> FsResult<()> {
        self.base.check_walk()
    }

    fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    async fn close(&self) -> FsResult<()> {
        if self.base.close().await {
            let _ = self.ipns.close().await;
        }
        Ok(())
    }

    async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)> {
        self.base.live()?;
        Ok(attr::synthesized_dir(want, self.base.config.block_size))
    }

    async fn opendir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let source = Arc::new(KeySource {
            resolver: Arc::clone(&self.base.resolver),
            salt: self.base.salt,
        });
        let mut stream = DirectoryStream::new(source, self.base.config.stream_depth);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_resolver::MockResolver;
    use crate::types::{NodeKind, OpenFlags};
    use crate::walkref::walk;

    fn sample() -> Arc<MockResolver> {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_dir("/ipfs/QmBlog");
        resolver.add_file("/ipfs/QmBlog/post", b"first post");
        resolver.add_key("blog", "/ipfs/QmBlog");
        resolver.add_dir("/ipfs/QmOther");
        resolver.set_name("peer", "/ipfs/QmOther");
        resolver
    }

    fn attach_root(resolver: Arc<MockResolver>) -> (KeyRef, CancellationToken) {
        let token = CancellationToken::new();
        let root = KeyRef::attach(
            resolver,
            FsConfig::default(),
            QidSalt::generate(),
            &token,
        )
        .unwrap();
        (root, token)
    }

    #[tokio::test]
    async fn listing_names_local_keys_with_types() {
        let (root, _token) = attach_root(sample());
        root.opendir().await.unwrap();
        let entries = root.readdir(0, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "blog");
        assert_eq!(entries[0].kind, NodeKind::Directory);
    }

    #[tokio::test]
    async fn key_name_yields_writable_tree() {
        let (root, _token) = attach_root(sample());
        let (qids, result) = walk(&root, &["blog", "post"]).await;
        assert_eq!(qids.len(), 2);
        let file = result.unwrap();
        assert_eq!(file.namespace(), Namespace::Files);
        file.open(OpenFlags {
            read: true,
            write: true,
            truncate: false,
        })
        .await
        .unwrap();
        let mut buf = [0u8; 16];
        let n = file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first post");
        file.write_at(0, b"First").await.unwrap();
        let n = file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"First post");
    }

    #[tokio::test]
    async fn non_key_names_fall_through_to_indirection() {
        let (root, _token) = attach_root(sample());
        let (qids, result) = walk(&root, &["peer"]).await;
        assert_eq!(qids.len(), 1);
        let stepped = result.unwrap();
        assert_eq!(stepped.namespace(), Namespace::Ipns);
    }

    #[tokio::test]
    async fn unknown_name_fails_both_ways() {
        let (root, _token) = attach_root(sample());
        let (qids, result) = walk(&root, &["nobody"]).await;
        assert!(qids.is_empty());
        assert!(matches!(result.err().unwrap().kind(), FsError::NotFound));
    }

    #[tokio::test]
    async fn same_key_shares_one_tree_across_references() {
        let (root, _token) = attach_root(sample());
        let (_, first) = walk(&root, &["blog"]).await;
        let first = first.unwrap();
        first.create("draft").await.unwrap();

        // A second walk joins the live tree, not the published target.
        let (_, second) = walk(&root, &["blog", "draft"]).await;
        second.unwrap().close().await.unwrap();
        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_walk_does_not_block_final_publish() {
        let resolver = sample();
        let (root, _token) = attach_root(Arc::clone(&resolver));
        let table = Arc::clone(&root.table);

        let (_, tree) = walk(&root, &["blog"]).await;
        let tree = tree.unwrap();

        // A dead-end lookup inside the key tree must not hold the shared
        // root open.
        let (_, missing) = walk(&root, &["blog", "nope"]).await;
        assert!(matches!(missing.err().unwrap().kind(), FsError::NotFound));

        tree.create("extra").await.unwrap();
        tree.close().await.unwrap();
        let target = resolver.published_target("blog").expect("key published");
        assert!(target.starts_with("/ipfs/"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn last_close_publishes_and_evicts() {
        let resolver = sample();
        let (root, _token) = attach_root(Arc::clone(&resolver));
        let table = Arc::clone(&root.table);

        let (_, tree) = walk(&root, &["blog"]).await;
        let tree = tree.unwrap();
        let (_, sibling) = walk(&root, &["blog"]).await;
        let sibling = sibling.unwrap();
        assert_eq!(table.len(), 1);

        tree.create("note").await.unwrap();
        tree.close().await.unwrap();
        // One reference still holds the root: nothing published yet.
        assert!(resolver.published_target("blog").is_none());
        assert_eq!(table.len(), 1);

        sibling.close().await.unwrap();
        let target = resolver.published_target("blog").expect("published");
        assert!(target.starts_with("/ipfs/"));
        assert_eq!(table.len(), 0);
    }
}
