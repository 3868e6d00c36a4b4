// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Overlay composer: one root directory mapping top-level names onto the
//! backend namespaces.
//!
//! The overlay owns one prototype reference per subsystem, all attached in
//! the overlay's filesystem scope. Stepping to a top-level name forks the
//! matching prototype; `..` at a subsystem root comes back through a weak
//! link to the overlay, so the composed tree cannot keep itself alive.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::attr;
use crate::context::FsScope;
use crate::error::{FsError, FsResult};
use crate::resolver::ContentResolver;
use crate::stream::{DirectoryStream, VecSource};
use crate::types::{DirectoryEntry, FsConfig, NodeKind, Qid, QidSalt, Stat, StatMask};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

use super::CoreBase;
use super::ipfs::ImmutableRef;
use super::keyfs::{KeyRef, RootTable};
use super::mfs::{FilesRef, MfsShared};
use super::pinfs::PinRef;

struct Subsystems {
    prototypes: Vec<(Namespace, Box<dyn WalkRef>)>,
}

/// Reference to the composed root.
pub struct OverlayRef {
    base: CoreBase,
    subsystems: OnceLock<Arc<Subsystems>>,
}

impl OverlayRef {
    /// Build the composed root and its subsystem prototypes.
    pub fn attach(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        salt: QidSalt,
        parent: &CancellationToken,
    ) -> FsResult<Arc<Self>> {
        let fs = FsScope::attach(parent);
        let root = Arc::new(Self {
            base: CoreBase::attach(
                Arc::clone(&resolver),
                config.clone(),
                Namespace::Overlay,
                salt,
                fs.clone(),
                None,
            )?,
            subsystems: OnceLock::new(),
        });
        let up = || Some(Arc::downgrade(&root) as Weak<dyn WalkRef>);

        let files_root = MfsShared::empty(
            Arc::clone(&resolver),
            None,
            Namespace::Files.prefix(),
            config.call_timeout,
        );
        let prototypes: Vec<(Namespace, Box<dyn WalkRef>)> = vec![
            (
                Namespace::Ipfs,
                Box::new(ImmutableRef::attach_scoped(
                    Arc::clone(&resolver),
                    config.clone(),
                    Namespace::Ipfs,
                    salt,
                    fs.clone(),
                    up(),
                )?),
            ),
            (
                Namespace::Ipns,
                Box::new(super::ipns::attach_scoped(
                    Arc::clone(&resolver),
                    config.clone(),
                    salt,
                    fs.clone(),
                    up(),
                )?),
            ),
            (
                Namespace::Files,
                Box::new(FilesRef::attach_shared(
                    Arc::clone(&resolver),
                    config.clone(),
                    salt,
                    fs.clone(),
                    up(),
                    files_root,
                    None,
                )?),
            ),
            (
                Namespace::PinFs,
                Box::new(PinRef::attach_scoped(
                    Arc::clone(&resolver),
                    config.clone(),
                    salt,
                    fs.clone(),
                    up(),
                )?),
            ),
            (
                Namespace::KeyFs,
                Box::new(KeyRef::attach_scoped(
                    Arc::clone(&resolver),
                    config,
                    salt,
                    fs,
                    up(),
                    RootTable::new(),
                )?),
            ),
        ];
        let _ = root.subsystems.set(Arc::new(Subsystems { prototypes }));
        Ok(root)
    }

    fn listing(&self) -> Vec<DirectoryEntry> {
        Namespace::ALL
            .iter()
            .map(|ns| DirectoryEntry {
                name: ns.name().to_string(),
                offset: 0,
                kind: NodeKind::Directory,
                qid: self.base.salt.synthetic_dir(ns.prefix()),
            })
            .collect()
    }
}

#[async_trait]
impl WalkRef for OverlayRef {
    fn namespace(&self) -> Namespace {
        Namespace::Overlay
    }

    async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
        let subsystems = OnceLock::new();
        if let Some(subs) = self.subsystems.get() {
            let _ = subsystems.set(Arc::clone(subs));
        }
        Ok(Box::new(Self {
            base: self.base.fork()?,
            subsystems,
        }))
    }

    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
        self.base.live()?;
        self.base.check_walk()?;
        let subs = self.subsystems.get().ok_or(FsError::NotInitialized)?;
        let proto = subs
            .prototypes
            .iter()
            .find(|(ns, _)| ns.name() == name)
            .map(|(_, proto)| proto)
            .ok_or(FsError::NotFound)?;
        let stepped = proto.fork().await?;
        let _ = self.close().await;
        Ok(stepped)
    }

    async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>> {
        // The composed root is the top; its parent is itself.
        self.base.live()?;
        Ok(self)
    }

    async fn qid(&self) -> FsResult<Qid> {
        self.base.live()?;
        Ok(self.base.salt.synthetic_dir(Namespace::Overlay.prefix()))
    }

    fn check_walk(&self) -> FsResult<()> {
        self.base.check_walk()
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
        Ok(attr::synthesized_dir(want, self.base.config.block_size))
    }

    async fn opendir(&self) -> FsResult<()> {
        let op = self.base.live()?;
        let mut stream = DirectoryStream::new(
            Arc::new(VecSource::new(self.listing())),
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
}
