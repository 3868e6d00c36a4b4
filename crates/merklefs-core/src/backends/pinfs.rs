// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pin-index adapter: a view listing currently pinned roots.
//!
//! The root directory is not a path walk; its listing is a snapshot of the
//! pin set fetched fresh on every open (and rewind). Stepping to any name
//! proxies into a forked immutable-adapter reference, because pins are a
//! view over content, not a storage location.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

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

/// Reference to the pin-index root.
pub struct PinRef {
    base: CoreBase,
    /// Prototype immutable reference forked for every delegated step.
    ipfs: ImmutableRef,
}

impl PinRef {
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        parent: &CancellationToken,
    ) -> FsResult<Self> {
        let fs = FsScope::attach(parent);
        Self::attach_scoped(resolver, config, salt, fs, None)
    }

    pub(crate) fn attach_scoped(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        fs: FsScope,
        parent: Option<Weak<dyn WalkRef>>,
    ) -> FsResult<Self> {
        let ipfs = ImmutableRef::attach_scoped(
            Arc::clone(&resolver),
            config.clone(),
            Namespace::Ipfs,
            salt,
            fs.clone(),
            None,
        )?;
        Ok(Self {
            base: CoreBase::attach(resolver, config, Namespace::PinFs, salt, fs, parent)?,
            ipfs,
        })
    }
}

/// Fetches the pin set and resolves each root's type, streaming entries.
struct PinSource {
    resolver: Arc<dyn ContentResolver>,
    salt: QidSalt,
}

#[async_trait]
impl EntrySource for PinSource {
    async fn send_entries(
        &self,
        scope: CancellationToken,
        out: tokio::sync::mpsc::Sender<FsResult<DirectoryEntry>>,
    ) {
        let pins = tokio::select! {
            _ = scope.cancelled() => return,
            pins = self.resolver.list_pins() => pins,
        };
        let pins = match pins {
            Ok(pins) => pins,
            Err(err) => {
                let _ = send_or_cancel(&scope, &out, Err(err.at("list_pins", "/pinfs"))).await;
                return;
            }
        };
        for cid in pins {
            let path = format!("/ipfs/{cid}");
            let resolved = tokio::select! {
                _ = scope.cancelled() => return,
                resolved = self.resolver.resolve_node(&path) => resolved,
            };
            let item = match resolved {
                Ok(info) => Ok(DirectoryEntry {
                    name: cid.to_string(),
                    offset: 0,
                    kind: info.kind,
                    qid: self.salt.qid_for(info.kind.into(), &info.cid),
                }),
                Err(err) => Err(err.at("resolve", &path)),
            };
            let stop = item.is_err();
            if !send_or_cancel(&scope, &out, item).await || stop {
                return;
            }
        }
    }
}

#[async_trait]
impl WalkRef for PinRef {
    fn namespace(&self) -> Namespace {
        Namespace::PinFs
    }

    async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
        Ok(Box::new(Self {
            base: self.base.fork()?,
            ipfs: self.ipfs.fork_self()?,
        }))
    }

    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
        // The pin index is a view; all non-root names live in the immutable
        // backend. The reference is spent whether or not the step lands.
        let stepped = async {
            self.base.live()?;
            self.base.check_walk()?;
            let delegate = Box::new(self.ipfs.fork_self()?);
            delegate.step(name).await
        }
        .await;
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
        Ok(self.base.salt.synthetic_dir(Namespace::PinFs.prefix()))
    }

    fn check_walk(&self) -> FsResult<()> {
        self.base.check_walk()
    }

    fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    async fn close(&self) -> FsResult<()> {
        if self.base.close().await {
            let _ = self.ipfs.close().await;
        }
        Ok(())
    }

    async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)> {
        self.base.live()?;
        Ok(attr::synthesized_dir(want, self.base.config.block_size))
    }

    async fn opendir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let source = Arc::new(PinSource {
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
    use crate::types::NodeKind;
    use crate::walkref::walk;

    fn pinned_resolver() -> Arc<MockResolver> {
        let resolver = Arc::new(MockResolver::new());
        let a = resolver.add_dir("/ipfs/QmPinA");
        resolver.add_file("/ipfs/QmPinA/data", b"pinned bytes");
        let b = resolver.add_file("/ipfs/QmPinB", b"solo file");
        let c = resolver.add_dir("/ipfs/QmPinC");
        resolver.pin(&a);
        resolver.pin(&b);
        resolver.pin(&c);
        resolver
    }

    fn attach(resolver: Arc<MockResolver>) -> (PinRef, CancellationToken) {
        let token = CancellationToken::new();
        let root = PinRef::attach(
            resolver,
            FsConfig::default(),
            QidSalt::generate(),
            &token,
        )
        .unwrap();
        (root, token)
    }

    #[tokio::test]
    async fn listing_is_a_snapshot_of_the_pin_set() {
        let (root, _token) = attach(pinned_resolver());
        root.opendir().await.unwrap();
        let entries = root.readdir(0, 0).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, NodeKind::Directory);
        assert_eq!(entries[1].kind, NodeKind::File);
    }

    #[tokio::test]
    async fn offset_bound_check() {
        let (root, _token) = attach(pinned_resolver());
        root.opendir().await.unwrap();
        let _ = root.readdir(0, 0).await.unwrap();
        // offset == total: end of stream, empty and ok.
        assert!(root.readdir(3, 0).await.unwrap().is_empty());
        // offset > total: past the directory bound.
        let err = root.readdir(4, 0).await.err().unwrap();
        assert!(matches!(err, FsError::OffsetBeyondBound { offset: 4, bound: 3 }));
    }

    #[tokio::test]
    async fn rewind_fetches_a_fresh_snapshot() {
        let resolver = pinned_resolver();
        let (root, _token) = attach(Arc::clone(&resolver));
        root.opendir().await.unwrap();
        assert_eq!(root.readdir(0, 0).await.unwrap().len(), 3);
        let d = resolver.add_dir("/ipfs/QmPinD");
        resolver.pin(&d);
        root.rewinddir().await.unwrap();
        assert_eq!(root.readdir(0, 0).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn step_delegates_into_the_immutable_backend() {
        let (root, _token) = attach(pinned_resolver());
        let (qids, result) = walk(&root, &["QmPinA", "data"]).await;
        assert_eq!(qids.len(), 2);
        let file = result.unwrap();
        assert_eq!(file.namespace(), Namespace::Ipfs);
        let (stat, _) = file.getattr(StatMask::ALL).await.unwrap();
        assert_eq!(stat.size, 12);
    }

    #[tokio::test]
    async fn step_to_unpinned_unknown_name_fails() {
        let (root, _token) = attach(pinned_resolver());
        let (qids, result) = walk(&root, &["QmNotHere"]).await;
        assert!(qids.is_empty());
        assert!(matches!(result.err().unwrap().kind(), FsError::NotFound));
    }

    #[tokio::test]
    async fn root_getattr_is_synthesized() {
        let resolver = pinned_resolver();
        let (root, _token) = attach(Arc::clone(&resolver));
        // A resolver fault must not affect the synthesized root stat.
        resolver.fail_next("resolve_node", 1);
        let (stat, filled) = root.getattr(StatMask::ALL).await.unwrap();
        assert_eq!(stat.kind, NodeKind::Directory);
        assert!(filled.kind);
    }
}
