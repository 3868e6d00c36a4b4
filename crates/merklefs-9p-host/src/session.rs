// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One 9P2000.L session: a fid table over core references plus the request
//! semantics of Attach/Walk/Open/Clunk and the node operations.
//!
//! The session is the boundary a transport drives after decoding a T-message;
//! it owns no sockets and does no byte-level framing. Each request runs on
//! the caller's task; the fid table lock is sync and never held across an
//! await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use merklefs_core::backends::ipfs::ImmutableRef;
use merklefs_core::backends::keyfs::KeyRef;
use merklefs_core::backends::mfs::FilesRef;
use merklefs_core::backends::overlay::OverlayRef;
use merklefs_core::backends::pinfs::PinRef;
use merklefs_core::error::FsError;
use merklefs_core::resolver::ContentResolver;
use merklefs_core::types::{FsConfig, NodeKind, QidSalt, QidType};
use merklefs_core::walkref::{WalkRef, walk};
use merklefs_proto::Namespace;

use crate::error::{HostError, HostResult};
use crate::types::{
    Attr9, Dirent9, DT_DIR, DT_LNK, DT_REG, Qid9, S_IFREG, SETATTR_SIZE, StatFs9, attr_of,
    open_flags, want_of,
};

const AT_REMOVEDIR: u32 = 0x200;
const S_IFMT: u32 = 0o170000;

/// Server-side state for one 9P connection.
pub struct Session {
    resolver: Arc<dyn ContentResolver>,
    config: FsConfig,
    salt: QidSalt,
    scope: CancellationToken,
    fids: Mutex<HashMap<u32, Arc<dyn WalkRef>>>,
}

impl Session {
    pub fn new(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        scope: &CancellationToken,
    ) -> Self {
        Self {
            resolver,
            config,
            salt: QidSalt::generate(),
            scope: scope.clone(),
            fids: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, fid: u32) -> HostResult<Arc<dyn WalkRef>> {
        self.fids
            .lock()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or(HostError::UnknownFid(fid))
    }

    /// Bind `fid` unless taken; returns the displaced reference when
    /// `replace` allows rebinding (walk with newfid == fid).
    fn bind(
        &self,
        fid: u32,
        r: Arc<dyn WalkRef>,
        replace: bool,
    ) -> Result<Option<Arc<dyn WalkRef>>, HostError> {
        let mut fids = self.fids.lock().unwrap();
        if !replace && fids.contains_key(&fid) {
            return Err(HostError::FidInUse(fid));
        }
        Ok(fids.insert(fid, r))
    }

    /// Tattach: bind `fid` to the root of `ns`.
    pub async fn attach(&self, fid: u32, ns: Namespace) -> HostResult<Qid9> {
        if self.fids.lock().unwrap().contains_key(&fid) {
            return Err(HostError::FidInUse(fid));
        }
        let resolver = Arc::clone(&self.resolver);
        let config = self.config.clone();
        let r: Arc<dyn WalkRef> = match ns {
            Namespace::Overlay => {
                OverlayRef::attach(resolver, config, self.salt, &self.scope)?
            }
            Namespace::Ipfs | Namespace::Ipns => Arc::new(ImmutableRef::attach(
                resolver,
                config,
                ns,
                self.salt,
                &self.scope,
            )?),
            Namespace::Files => {
                Arc::new(FilesRef::attach(resolver, config, self.salt, &self.scope)?)
            }
            Namespace::PinFs => {
                Arc::new(PinRef::attach(resolver, config, self.salt, &self.scope)?)
            }
            Namespace::KeyFs => {
                Arc::new(KeyRef::attach(resolver, config, self.salt, &self.scope)?)
            }
        };
        let qid = r.qid().await?;
        if let Err(err) = self.bind(fid, r, false) {
            return Err(err);
        }
        debug!(fid, namespace = %ns, "attached");
        Ok(qid.into())
    }

    /// Twalk: clone `fid` to `newfid`, then advance by `names`.
    ///
    /// Full success binds `newfid` and returns one qid per name. Partial
    /// success after at least one name returns the accumulated prefix
    /// without binding; failure on the first name is an error.
    pub async fn walk(&self, fid: u32, newfid: u32, names: &[&str]) -> HostResult<Vec<Qid9>> {
        let src = self.get(fid)?;
        if newfid != fid && self.fids.lock().unwrap().contains_key(&newfid) {
            return Err(HostError::FidInUse(newfid));
        }
        let (qids, outcome) = walk(&*src, names).await;
        let wire: Vec<Qid9> = qids.into_iter().map(Qid9::from).collect();
        match outcome {
            Ok(stepped) => {
                let displaced = self.bind(newfid, Arc::from(stepped), newfid == fid)?;
                if let Some(old) = displaced {
                    old.close().await?;
                }
                Ok(wire)
            }
            Err(_) if !wire.is_empty() => Ok(wire),
            Err(err) => Err(err.into()),
        }
    }

    /// Tclunk: release the fid. The fid is gone even if close reports a
    /// flush failure; the error still reaches the client.
    pub async fn clunk(&self, fid: u32) -> HostResult<()> {
        let r = self
            .fids
            .lock()
            .unwrap()
            .remove(&fid)
            .ok_or(HostError::UnknownFid(fid))?;
        r.close().await?;
        Ok(())
    }

    /// Tlopen.
    pub async fn open(&self, fid: u32, l_flags: u32) -> HostResult<Qid9> {
        let r = self.get(fid)?;
        let qid = r.qid().await?;
        if qid.kind == QidType::Directory {
            let flags = open_flags(l_flags)?;
            if flags.write || flags.truncate {
                return Err(FsError::IsADirectory.into());
            }
            r.opendir().await?;
        } else {
            r.open(open_flags(l_flags)?).await?;
        }
        Ok(qid.into())
    }

    /// Tgetattr.
    pub async fn getattr(&self, fid: u32, request_mask: u64) -> HostResult<Attr9> {
        let r = self.get(fid)?;
        let qid = r.qid().await?;
        let (stat, filled) = r.getattr(want_of(request_mask)).await?;
        Ok(attr_of(&stat, filled, qid.into(), r.namespace().writable()))
    }

    /// Tsetattr: only the size bit is meaningful; ownership and times have
    /// no representation in the store and are accepted as no-ops.
    pub async fn setattr(&self, fid: u32, valid: u64, size: u64) -> HostResult<()> {
        let r = self.get(fid)?;
        if valid & SETATTR_SIZE != 0 {
            r.setattr_size(size).await?;
        }
        Ok(())
    }

    /// Treaddir: `offset` is the resume token from the last entry delivered,
    /// 0 for the start.
    pub async fn readdir(&self, fid: u32, offset: u64, count: usize) -> HostResult<Vec<Dirent9>> {
        let r = self.get(fid)?;
        let entries = r.readdir(offset, count).await?;
        Ok(entries
            .into_iter()
            .map(|e| Dirent9 {
                qid: e.qid.into(),
                offset: e.offset,
                typ: match e.kind {
                    NodeKind::Directory => DT_DIR,
                    NodeKind::File => DT_REG,
                    NodeKind::Symlink => DT_LNK,
                },
                name: e.name,
            })
            .collect())
    }

    /// Tread on an opened file.
    pub async fn read(&self, fid: u32, offset: u64, count: usize) -> HostResult<Vec<u8>> {
        let r = self.get(fid)?;
        let mut buf = vec![0u8; count];
        let n = r.read_at(offset, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Twrite on an opened file.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> HostResult<u32> {
        let r = self.get(fid)?;
        let n = r.write_at(offset, data).await?;
        Ok(n as u32)
    }

    /// Tlcreate: create `name` under the directory fid, then the fid
    /// represents the new file, opened with `l_flags`.
    pub async fn create(&self, fid: u32, name: &str, l_flags: u32) -> HostResult<Qid9> {
        let dir = self.get(fid)?;
        dir.create(name).await?;
        let (_, stepped) = walk(&*dir, &[name]).await;
        let file = stepped?;
        file.open(open_flags(l_flags)?).await?;
        let qid = file.qid().await?;
        if let Some(old) = self.bind(fid, Arc::from(file), true)? {
            old.close().await?;
        }
        Ok(qid.into())
    }

    /// Tmkdir.
    pub async fn mkdir(&self, fid: u32, name: &str) -> HostResult<Qid9> {
        let dir = self.get(fid)?;
        dir.mkdir(name).await?;
        self.child_qid(&*dir, name).await
    }

    /// Tsymlink.
    pub async fn symlink(&self, fid: u32, name: &str, target: &str) -> HostResult<Qid9> {
        let dir = self.get(fid)?;
        dir.symlink(name, target).await?;
        self.child_qid(&*dir, name).await
    }

    /// Tmknod: only regular files can be made; device nodes and pipes have
    /// no representation in the store.
    pub async fn mknod(&self, fid: u32, name: &str, mode: u32) -> HostResult<Qid9> {
        if mode & S_IFMT != S_IFREG && mode & S_IFMT != 0 {
            return Err(FsError::InvalidOperation.into());
        }
        let dir = self.get(fid)?;
        dir.create(name).await?;
        self.child_qid(&*dir, name).await
    }

    /// Tunlinkat.
    pub async fn unlinkat(&self, fid: u32, name: &str, flags: u32) -> HostResult<()> {
        let dir = self.get(fid)?;
        dir.unlink(name, flags & AT_REMOVEDIR != 0).await?;
        Ok(())
    }

    /// Trenameat. Both directory fids must live on the same tree.
    pub async fn renameat(
        &self,
        olddirfid: u32,
        oldname: &str,
        newdirfid: u32,
        newname: &str,
    ) -> HostResult<()> {
        let old_dir = self.get(olddirfid)?;
        let new_dir = self.get(newdirfid)?;
        if old_dir.device() != new_dir.device() {
            return Err(HostError::CrossDevice);
        }
        old_dir.rename(oldname, &new_dir.trail(), newname).await?;
        Ok(())
    }

    /// Treadlink.
    pub async fn readlink(&self, fid: u32) -> HostResult<String> {
        let r = self.get(fid)?;
        Ok(r.readlink().await?)
    }

    /// Tstatfs: synthesized, there is no capacity accounting to report.
    pub async fn statfs(&self, fid: u32) -> HostResult<StatFs9> {
        let r = self.get(fid)?;
        Ok(StatFs9::synthesized(self.config.block_size, r.device()))
    }

    async fn child_qid(&self, dir: &dyn WalkRef, name: &str) -> HostResult<Qid9> {
        let (_, stepped) = walk(dir, &[name]).await;
        let child = stepped?;
        let qid = child.qid().await?;
        child.close().await?;
        Ok(qid.into())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // References are cancellation-scoped; dropping the table is enough
        // for immutable backends. Writable roots flush through clunk, which
        // transports issue before teardown.
        self.fids.lock().unwrap().clear();
    }
}
