// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Immutable content-addressed tree adapter.
//!
//! Every QID/attribute/open call re-resolves `namespace + trail` through the
//! content resolver; the backend is immutable, so there is no cache to keep
//! coherent. The same adapter serves the indirected namespace (see
//! `backends::ipns`), parameterized only by prefix.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attr;
use crate::context::{FsScope, bounded};
use crate::error::{FsError, FsResult};
use crate::resolver::ContentResolver;
use crate::stream::{DirectoryStream, EntrySource, send_or_cancel};
use crate::types::{
    DirectoryEntry, FsConfig, NodeKind, OpenFlags, Qid, QidSalt, Stat, StatMask,
};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

use super::CoreBase;

/// Reference into an immutable content-addressed tree.
pub struct ImmutableRef {
    pub(crate) base: CoreBase,
}

impl ImmutableRef {
    /// Bind a fresh reference to the backend root, deriving a
    /// filesystem-scoped context from `parent` (the process-wide token).
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        ns: Namespace,
        salt: QidSalt,
        parent: &CancellationToken,
    ) -> FsResult<Self> {
        let fs = FsScope::attach(parent);
        Ok(Self {
            base: CoreBase::attach(resolver, config, ns, salt, fs, None)?,
        })
    }

    /// Attach within an existing filesystem scope, optionally linked to a
    /// parent reference for `..` at the root.
    pub(crate) fn attach_scoped(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        ns: Namespace,
        salt: QidSalt,
        fs: FsScope,
        parent: Option<Weak<dyn WalkRef>>,
    ) -> FsResult<Self> {
        Ok(Self {
            base: CoreBase::attach(resolver, config, ns, salt, fs, parent)?,
        })
    }

    /// Typed fork, used by the pin/key indexes when they delegate steps.
    pub(crate) fn fork_self(&self) -> FsResult<ImmutableRef> {
        Ok(Self {
            base: self.base.fork()?,
        })
    }
}

/// Producer over the resolver's child-listing capability.
struct LsSource {
    resolver: Arc<dyn ContentResolver>,
    path: String,
    salt: QidSalt,
}

#[async_trait]
impl EntrySource for LsSource {
    async fn send_entries(
        &self,
        scope: CancellationToken,
        out: tokio::sync::mpsc::Sender<FsResult<DirectoryEntry>>,
    ) {
        let listing = tokio::select! {
            _ = scope.cancelled() => return,
            listing = self.resolver.ls(&self.path) => listing,
        };
        let mut rx = match listing {
            Ok(rx) => rx,
            Err(err) => {
                let _ = send_or_cancel(&scope, &out, Err(err.at("ls", &self.path))).await;
                return;
            }
        };
        loop {
            let item = tokio::select! {
                _ = scope.cancelled() => return,
                item = rx.recv() => item,
            };
            match item {
                Some(Ok(child)) => {
                    let entry = DirectoryEntry {
                        qid: self.salt.qid_for(child.kind.into(), &child.cid),
                        name: child.name,
                        offset: 0,
                        kind: child.kind,
                    };
                    if !send_or_cancel(&scope, &out, Ok(entry)).await {
                        return;
                    }
                }
                Some(Err(err)) => {
                    let _ = send_or_cancel(&scope, &out, Err(err.at("ls", &self.path))).await;
                    return;
                }
                None => return,
            }
        }
    }
}

#[async_trait]
impl WalkRef for ImmutableRef {
    fn namespace(&self) -> Namespace {
        self.base.ns
    }

    async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
        Ok(Box::new(self.fork_self()?))
    }

    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
        self.base.live()?;
        self.base.check_walk()?;
        // The namespace root is directory-typed by definition and has no
        // backing content to resolve.
        if !self.base.trail.is_empty() {
            let here = self.base.resolve().await?;
            if here.kind != NodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
        }
        // Surface missing children here rather than at the next QID call.
        let child = self.base.child_path(name);
        self.base.resolve_path(&child).await?;
        let mut this = *self;
        this.base.trail.push(name.to_string());
        debug!(path = %this.base.full_path(), "step");
        Ok(Box::new(this))
    }

    async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>> {
        self.base.live()?;
        let mut this = *self;
        if this.base.trail.pop().is_none() {
            if let Some(parent) = this.base.parent.as_ref().and_then(Weak::upgrade) {
                return parent.fork().await;
            }
            // Standalone root: its own parent.
        }
        Ok(Box::new(this))
    }

    async fn qid(&self) -> FsResult<Qid> {
        self.base.live()?;
        if self.base.trail.is_empty() {
            return Ok(self.base.salt.synthetic_dir(self.base.ns.prefix()));
        }
        let info = self.base.resolve().await?;
        Ok(self.base.salt.qid_for(info.kind.into(), &info.cid))
    }

    fn check_walk(&self) -> FsResult<()> {
        self.base.check_walk()
    }

    fn trail(&self) -> Vec<String> {
        self.base.trail.clone()
    }

    fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    async fn close(&self) -> FsResult<()> {
        self.base.close().await;
        Ok(())
    }

    async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)> {
        self.base.live()?;
        if self.base.trail.is_empty() {
            return Ok(attr::synthesized_dir(want, self.base.config.block_size));
        }
        let info = self.base.resolve().await?;
        Ok(attr::translate(&info, want, self.base.config.block_size))
    }

    async fn open(&self, flags: OpenFlags) -> FsResult<()> {
        let op = self.base.live()?;
        if flags.write || flags.truncate {
            return Err(FsError::InvalidOperation);
        }
        if self.base.trail.is_empty() {
            return Err(FsError::IsADirectory);
        }
        let info = self.base.resolve().await?;
        if info.kind == NodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        let path = self.base.full_path();
        let file = bounded(op, self.base.config.call_timeout, self.base.resolver.get(&path))
            .await
            .map_err(|e| e.at("get", &path))?;
        *self.base.file.lock().await = Some(file);
        self.base.mark_open();
        Ok(())
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.base.live()?;
        let mut guard = self.base.file.lock().await;
        let file = guard.as_mut().ok_or(FsError::InvalidOperation)?;
        file.read_at(offset, buf)
    }

    async fn opendir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let source: Arc<dyn EntrySource> = if self.base.trail.is_empty() {
            // The namespace root is not enumerable; present it as empty.
            Arc::new(crate::stream::VecSource::new(Vec::new()))
        } else {
            let info = self.base.resolve().await?;
            if info.kind != NodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            Arc::new(LsSource {
                resolver: Arc::clone(&self.base.resolver),
                path: self.base.full_path(),
                salt: self.base.salt,
            })
        };
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

    async fn readlink(&self) -> FsResult<String> {
        let info = self.base.resolve().await?;
        info.target.ok_or(FsError::InvalidOperation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_resolver::MockResolver;
    use crate::walkref::walk;

    fn sample_resolver() -> Arc<MockResolver> {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_dir("/ipfs/QmRoot");
        resolver.add_dir("/ipfs/QmRoot/docs");
        resolver.add_file("/ipfs/QmRoot/docs/readme", b"merkle trees all the way down");
        resolver.add_file("/ipfs/QmRoot/hello", b"hello");
        resolver.add_symlink("/ipfs/QmRoot/link", "docs/readme");
        resolver
    }

    fn attach(resolver: Arc<MockResolver>) -> (ImmutableRef, CancellationToken) {
        let token = CancellationToken::new();
        let fs_root = ImmutableRef::attach(
            resolver,
            FsConfig::default(),
            Namespace::Ipfs,
            QidSalt::generate(),
            &token,
        )
        .unwrap();
        (fs_root, token)
    }

    #[tokio::test]
    async fn walks_to_nested_file() {
        let (root, _token) = attach(sample_resolver());
        let (qids, result) = walk(&root, &["QmRoot", "docs", "readme"]).await;
        assert_eq!(qids.len(), 3);
        let file = result.unwrap();
        let (stat, filled) = file.getattr(StatMask::ALL).await.unwrap();
        assert!(filled.size);
        assert_eq!(stat.kind, NodeKind::File);
        assert_eq!(stat.size, 29);
    }

    #[tokio::test]
    async fn step_through_file_is_not_a_directory() {
        let (root, _token) = attach(sample_resolver());
        let (qids, result) = walk(&root, &["QmRoot", "hello", "deeper"]).await;
        assert_eq!(qids.len(), 2);
        assert!(matches!(result.err().unwrap().kind(), FsError::NotADirectory));
    }

    #[tokio::test]
    async fn missing_child_preserves_prefix() {
        let (root, _token) = attach(sample_resolver());
        let (qids, result) = walk(&root, &["QmRoot", "docs", "nope", "d"]).await;
        assert_eq!(qids.len(), 2);
        assert!(matches!(result.err().unwrap().kind(), FsError::NotFound));
    }

    #[tokio::test]
    async fn open_and_read_file_content() {
        let (root, _token) = attach(sample_resolver());
        let (_, result) = walk(&root, &["QmRoot", "hello"]).await;
        let file = result.unwrap();
        file.open(OpenFlags::READ).await.unwrap();
        let mut buf = [0u8; 16];
        let n = file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn write_open_is_rejected_on_immutable_backend() {
        let (root, _token) = attach(sample_resolver());
        let (_, result) = walk(&root, &["QmRoot", "hello"]).await;
        let file = result.unwrap();
        assert!(matches!(
            file.open(OpenFlags::WRITE).await,
            Err(FsError::InvalidOperation)
        ));
    }

    #[tokio::test]
    async fn readdir_lists_children_with_offsets() {
        let (root, _token) = attach(sample_resolver());
        let (_, result) = walk(&root, &["QmRoot"]).await;
        let dir = result.unwrap();
        dir.opendir().await.unwrap();
        let entries = dir.readdir(0, 0).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "hello", "link"]);
        assert_eq!(entries[0].offset, 1);
        // Resume after the first entry yields the suffix.
        let rest = dir.readdir(1, 0).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].name, "hello");
    }

    #[tokio::test]
    async fn open_then_step_is_rejected_but_fork_is_not() {
        let (root, _token) = attach(sample_resolver());
        let (_, result) = walk(&root, &["QmRoot"]).await;
        let dir = result.unwrap();
        dir.opendir().await.unwrap();
        assert!(matches!(dir.check_walk(), Err(FsError::FileOpen)));
        // Fork is always allowed; the walk clones first.
        let (qids, forked) = walk(dir.as_ref(), &["docs"]).await;
        assert_eq!(qids.len(), 1);
        forked.unwrap();
        // Stepping the open reference itself must fail.
        let err = dir.step("docs").await.err().unwrap();
        assert!(matches!(err, FsError::FileOpen));
    }

    #[tokio::test]
    async fn fork_chain_survives_middle_close() {
        let (root, _token) = attach(sample_resolver());
        let gen1 = root.fork().await.unwrap();
        let gen2 = gen1.fork().await.unwrap();
        let gen3 = gen2.fork().await.unwrap();
        let gen4 = gen3.fork().await.unwrap();
        gen2.close().await.unwrap();
        assert!(gen3.qid().await.is_ok());
        assert!(gen4.qid().await.is_ok());
        assert!(matches!(gen2.fork().await, Err(FsError::Closed)));
        // Double close is a no-op.
        gen2.close().await.unwrap();
    }

    #[tokio::test]
    async fn detach_cancels_every_reference() {
        let (root, token) = attach(sample_resolver());
        let forked = root.fork().await.unwrap();
        token.cancel();
        assert!(matches!(forked.qid().await, Err(FsError::Canceled)));
        assert!(matches!(root.fork().await, Err(FsError::Canceled)));
    }

    #[tokio::test]
    async fn readlink_returns_target() {
        let (root, _token) = attach(sample_resolver());
        let (_, result) = walk(&root, &["QmRoot", "link"]).await;
        let link = result.unwrap();
        assert_eq!(link.readlink().await.unwrap(), "docs/readme");
    }

    #[tokio::test]
    async fn resolver_fault_surfaces_with_context() {
        let resolver = sample_resolver();
        let (root, _token) = attach(Arc::clone(&resolver));
        let (_, result) = walk(&root, &["QmRoot"]).await;
        let dir = result.unwrap();
        resolver.fail_next("resolve_node", 1);
        let err = dir.qid().await.err().unwrap();
        assert!(err.to_string().contains("/ipfs/QmRoot"));
    }
}
