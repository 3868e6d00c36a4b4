// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE adapter: maps kernel requests onto walk references.
//!
//! The kernel speaks inodes; the reference engine speaks walks from a root.
//! The adapter keeps a bidirectional inode <-> name-trail table and performs
//! a fresh walk per request, so every answer reflects the store as it is
//! now. Open files and directories hold their walked reference in a handle
//! table instead, keyed by the FUSE file handle.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{
    EBADF, EINVAL, EIO, ENAMETOOLONG, ENOENT, ENOTSUP, EXDEV, O_ACCMODE, O_RDWR, O_TRUNC,
    O_WRONLY, c_int,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use merklefs_core::error::FsError;
use merklefs_core::types::{FsConfig, NodeKind, OpenFlags, QidSalt, Stat, StatMask};
use merklefs_core::walkref::{WalkRef, walk};
use merklefs_core::{
    ContentResolver,
    backends::{
        ipfs::ImmutableRef, keyfs::KeyRef, mfs::FilesRef, overlay::OverlayRef, pinfs::PinRef,
    },
};
use merklefs_proto::Namespace;

/// Maximum single path component length.
const NAME_MAX: usize = 255;

/// Entries pulled from a directory stream per kernel readdir round.
const READDIR_BATCH: usize = 32;

/// Total mapping from core error kinds to negated-free errno values.
fn errno_of(err: &FsError) -> c_int {
    match err.kind() {
        FsError::NotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::IsADirectory => libc::EISDIR,
        FsError::NotADirectory => libc::ENOTDIR,
        FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
        FsError::RenameCycle => EINVAL,
        FsError::AccessDenied => libc::EACCES,
        FsError::InvalidOperation => ENOTSUP,
        FsError::NotInitialized => EIO,
        FsError::Closed => EBADF,
        FsError::FileOpen | FsError::AlreadyOpen => libc::EBUSY,
        FsError::OffsetBeyondBound { .. } => EINVAL,
        FsError::Canceled => libc::EINTR,
        FsError::TimedOut => libc::ETIMEDOUT,
        FsError::Io(_) => EIO,
        FsError::Resolver { .. } => EIO,
    }
}

/// FUSE host over one mounted namespace.
pub struct MerkleFuse {
    rt: Runtime,
    root: Arc<dyn WalkRef>,
    scope: CancellationToken,
    config: FsConfig,
    attr_ttl: Duration,
    entry_ttl: Duration,
    /// inode -> name trail below the mounted root.
    inodes: HashMap<u64, Vec<String>>,
    paths: HashMap<Vec<String>, u64>,
    next_inode: u64,
    /// FUSE file handle -> walked reference held open.
    handles: HashMap<u64, Box<dyn WalkRef>>,
    next_fh: u64,
}

impl MerkleFuse {
    pub fn new(
        resolver: Arc<dyn ContentResolver>,
        config: FsConfig,
        ns: Namespace,
    ) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let scope = CancellationToken::new();
        let salt = QidSalt::generate();
        let root: Arc<dyn WalkRef> = match ns {
            Namespace::Overlay => {
                OverlayRef::attach(Arc::clone(&resolver), config.clone(), salt, &scope)?
            }
            Namespace::Ipfs | Namespace::Ipns => Arc::new(ImmutableRef::attach(
                Arc::clone(&resolver),
                config.clone(),
                ns,
                salt,
                &scope,
            )?),
            Namespace::Files => Arc::new(FilesRef::attach(
                Arc::clone(&resolver),
                config.clone(),
                salt,
                &scope,
            )?),
            Namespace::PinFs => Arc::new(PinRef::attach(
                Arc::clone(&resolver),
                config.clone(),
                salt,
                &scope,
            )?),
            Namespace::KeyFs => Arc::new(KeyRef::attach(
                Arc::clone(&resolver),
                config.clone(),
                salt,
                &scope,
            )?),
        };

        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, Vec::new());
        paths.insert(Vec::new(), FUSE_ROOT_ID);

        Ok(Self {
            rt,
            root,
            scope,
            config,
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
            handles: HashMap::new(),
            next_fh: 1,
        })
    }

    fn trail_of(&self, ino: u64) -> Option<Vec<String>> {
        self.inodes.get(&ino).cloned()
    }

    fn get_or_alloc_inode(&mut self, trail: Vec<String>) -> u64 {
        if let Some(&ino) = self.paths.get(&trail) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(trail.clone(), ino);
        self.inodes.insert(ino, trail);
        ino
    }

    fn forget_trail(&mut self, trail: &[String]) {
        if let Some(ino) = self.paths.remove(trail) {
            self.inodes.remove(&ino);
        }
    }

    /// Rewrite every tracked trail under `old` to live under `new`.
    fn remap_prefix(&mut self, old: &[String], new: &[String]) {
        let moved: Vec<(Vec<String>, u64)> = self
            .paths
            .iter()
            .filter(|(trail, _)| trail.starts_with(old))
            .map(|(trail, &ino)| (trail.clone(), ino))
            .collect();
        for (trail, ino) in moved {
            self.paths.remove(&trail);
            let mut rewritten = new.to_vec();
            rewritten.extend_from_slice(&trail[old.len()..]);
            self.paths.insert(rewritten.clone(), ino);
            self.inodes.insert(ino, rewritten);
        }
    }

    /// Fresh walk from the mounted root down to `trail`.
    fn walk_to(&self, trail: &[String]) -> Result<Box<dyn WalkRef>, c_int> {
        let names: Vec<&str> = trail.iter().map(String::as_str).collect();
        let (_, outcome) = self.rt.block_on(walk(&*self.root, &names));
        outcome.map_err(|e| errno_of(&e))
    }

    fn close_ref(&self, r: Box<dyn WalkRef>) {
        if let Err(err) = self.rt.block_on(r.close()) {
            warn!(error = %err, "closing walked reference failed");
        }
    }

    fn stat_of(&self, r: &dyn WalkRef) -> Result<(Stat, StatMask), c_int> {
        self.rt
            .block_on(r.getattr(StatMask::ALL))
            .map_err(|e| errno_of(&e))
    }

    fn file_attr(&self, ino: u64, stat: &Stat, writable: bool) -> FileAttr {
        let (kind, perm, nlink) = match stat.kind {
            NodeKind::Directory => (
                FileType::Directory,
                if writable { 0o775 } else { 0o555 },
                2,
            ),
            NodeKind::File => (
                FileType::RegularFile,
                if writable { 0o664 } else { 0o444 },
                1,
            ),
            NodeKind::Symlink => (FileType::Symlink, 0o777, 1),
        };
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.blocks,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm,
            nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: self.config.block_size,
            flags: 0,
        }
    }

    /// Walk to `trail`, stat it, close the reference, shape the attr.
    fn attr_at(&mut self, trail: &[String]) -> Result<FileAttr, c_int> {
        let r = self.walk_to(trail)?;
        let writable = r.namespace().writable();
        let stat = match self.stat_of(&*r) {
            Ok((stat, _)) => stat,
            Err(code) => {
                self.close_ref(r);
                return Err(code);
            }
        };
        self.close_ref(r);
        let ino = self.get_or_alloc_inode(trail.to_vec());
        Ok(self.file_attr(ino, &stat, writable))
    }

    fn child_trail(&self, parent: u64, name: &OsStr) -> Result<Vec<String>, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        if name.len() > NAME_MAX {
            return Err(ENAMETOOLONG);
        }
        let mut trail = self.trail_of(parent).ok_or(ENOENT)?;
        trail.push(name.to_string());
        Ok(trail)
    }

    fn bind_handle(&mut self, r: Box<dyn WalkRef>) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, r);
        fh
    }

    fn open_flags(flags: i32) -> Result<OpenFlags, c_int> {
        let accmode = flags & O_ACCMODE;
        if accmode == O_ACCMODE {
            return Err(EINVAL);
        }
        Ok(OpenFlags {
            read: accmode != O_WRONLY,
            write: matches!(accmode, O_WRONLY | O_RDWR),
            truncate: flags & O_TRUNC != 0,
        })
    }
}

impl fuser::Filesystem for MerkleFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(
            namespace = self.root.namespace().name(),
            "FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        // Closing the handles flushes any mutable trees still open.
        let handles: Vec<_> = self.handles.drain().collect();
        for (_, r) in handles {
            self.close_ref(r);
        }
        self.scope.cancel();
        info!("FUSE adapter destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let trail = match self.child_trail(parent, name) {
            Ok(trail) => trail,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.attr_at(&trail) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.attr_at(&trail) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        if let Some(size) = size {
            let r = match self.walk_to(&trail) {
                Ok(r) => r,
                Err(code) => {
                    reply.error(code);
                    return;
                }
            };
            let outcome = self.rt.block_on(r.setattr_size(size));
            self.close_ref(r);
            if let Err(err) = outcome {
                reply.error(errno_of(&err));
                return;
            }
        }
        // Ownership and timestamps are synthesized, so the remaining
        // fields are accepted as no-ops.
        match self.attr_at(&trail) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let r = match self.walk_to(&trail) {
            Ok(r) => r,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let outcome = self.rt.block_on(r.readlink());
        self.close_ref(r);
        match outcome {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let open_flags = match Self::open_flags(flags) {
            Ok(open_flags) => open_flags,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let r = match self.walk_to(&trail) {
            Ok(r) => r,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        if let Err(err) = self.rt.block_on(r.open(open_flags)) {
            self.close_ref(r);
            reply.error(errno_of(&err));
            return;
        }
        let fh = self.bind_handle(r);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(r) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self.rt.block_on(r.read_at(offset.max(0) as u64, &mut buf)) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(r) = self.handles.get(&fh) else {
            reply.error(EBADF);
            return;
        };
        match self.rt.block_on(r.write_at(offset.max(0) as u64, data)) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(r) = self.handles.remove(&fh) else {
            reply.error(EBADF);
            return;
        };
        // A failed close can mean a failed flush of a mutable tree; the
        // kernel must hear about it.
        match self.rt.block_on(r.close()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let r = match self.walk_to(&trail) {
            Ok(r) => r,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        if let Err(err) = self.rt.block_on(r.opendir()) {
            self.close_ref(r);
            reply.error(errno_of(&err));
            return;
        }
        let fh = self.bind_handle(r);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_trail) = self.trail_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        if !self.handles.contains_key(&fh) {
            reply.error(EBADF);
            return;
        }
        let mut resume = offset.max(0) as u64;
        'fill: loop {
            // Scoped so the handle borrow ends before inodes are allocated.
            let outcome = {
                let r = &self.handles[&fh];
                self.rt.block_on(r.readdir(resume, READDIR_BATCH))
            };
            let batch = match outcome {
                Ok(batch) => batch,
                Err(err) => {
                    reply.error(errno_of(&err));
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let mut trail = dir_trail.clone();
                trail.push(entry.name.clone());
                let entry_ino = self.get_or_alloc_inode(trail);
                let file_type = match entry.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                    NodeKind::Symlink => FileType::Symlink,
                };
                if reply.add(entry_ino, entry.offset as i64, file_type, &entry.name) {
                    break 'fill;
                }
                resume = entry.offset;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let Some(r) = self.handles.remove(&fh) else {
            reply.error(EBADF);
            return;
        };
        self.close_ref(r);
        reply.ok();
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let file_type = mode & libc::S_IFMT;
        if file_type != libc::S_IFREG && file_type != 0 {
            reply.error(ENOTSUP);
            return;
        }
        self.make_child(parent, name, reply, |rt, dir, name| {
            rt.block_on(dir.create(name))
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.make_child(parent, name, reply, |rt, dir, name| {
            rt.block_on(dir.mkdir(name))
        });
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let target = target.to_string_lossy().into_owned();
        self.make_child(parent, link_name, reply, move |rt, dir, name| {
            rt.block_on(dir.symlink(name, &target))
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_child(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_child(parent, name, true, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_trail, new_trail) = match (
            self.child_trail(parent, name),
            self.child_trail(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(code), _) | (_, Err(code)) => {
                reply.error(code);
                return;
            }
        };
        let old_parent = match self.walk_to(&old_trail[..old_trail.len() - 1]) {
            Ok(r) => r,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let new_parent = match self.walk_to(&new_trail[..new_trail.len() - 1]) {
            Ok(r) => r,
            Err(code) => {
                self.close_ref(old_parent);
                reply.error(code);
                return;
            }
        };
        if old_parent.device() != new_parent.device() {
            self.close_ref(old_parent);
            self.close_ref(new_parent);
            reply.error(EXDEV);
            return;
        }
        let old_name = old_trail.last().map(String::as_str).unwrap_or_default();
        let new_name = new_trail.last().map(String::as_str).unwrap_or_default();
        let outcome = self
            .rt
            .block_on(old_parent.rename(old_name, &new_parent.trail(), new_name));
        self.close_ref(new_parent);
        self.close_ref(old_parent);
        match outcome {
            Ok(()) => {
                self.forget_trail(&new_trail);
                self.remap_prefix(&old_trail, &new_trail);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let trail = match self.child_trail(parent, name) {
            Ok(trail) => trail,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let open_flags = match Self::open_flags(flags) {
            Ok(open_flags) => open_flags,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let dir = match self.walk_to(&trail[..trail.len() - 1]) {
            Ok(dir) => dir,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let name = trail.last().map(String::as_str).unwrap_or_default();
        let outcome = self.rt.block_on(dir.create(name));
        self.close_ref(dir);
        if let Err(err) = outcome {
            reply.error(errno_of(&err));
            return;
        }
        let child = match self.walk_to(&trail) {
            Ok(child) => child,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let writable = child.namespace().writable();
        let stat = match self.stat_of(&*child) {
            Ok((stat, _)) => stat,
            Err(code) => {
                self.close_ref(child);
                reply.error(code);
                return;
            }
        };
        if let Err(err) = self.rt.block_on(child.open(open_flags)) {
            self.close_ref(child);
            reply.error(errno_of(&err));
            return;
        }
        let ino = self.get_or_alloc_inode(trail);
        let attr = self.file_attr(ino, &stat, writable);
        let fh = self.bind_handle(child);
        reply.created(&self.entry_ttl, &attr, 0, fh, 0);
    }

    fn flush(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Mutable trees flush on last close.
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // Synthesized geometry; the store has no meaningful totals.
        reply.statfs(0, 0, 0, 0, 0, self.config.block_size, NAME_MAX as u32, self.config.block_size);
    }
}

impl MerkleFuse {
    /// Shared shape of mknod/mkdir/symlink: mutate the parent, then look
    /// the new child up for the reply entry.
    fn make_child(
        &mut self,
        parent: u64,
        name: &OsStr,
        reply: ReplyEntry,
        op: impl FnOnce(&Runtime, &dyn WalkRef, &str) -> Result<(), FsError>,
    ) {
        let trail = match self.child_trail(parent, name) {
            Ok(trail) => trail,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let dir = match self.walk_to(&trail[..trail.len() - 1]) {
            Ok(dir) => dir,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let name = trail.last().map(String::as_str).unwrap_or_default();
        let outcome = op(&self.rt, &*dir, name);
        self.close_ref(dir);
        if let Err(err) = outcome {
            reply.error(errno_of(&err));
            return;
        }
        match self.attr_at(&trail) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn remove_child(&mut self, parent: u64, name: &OsStr, dir_flag: bool, reply: ReplyEmpty) {
        let trail = match self.child_trail(parent, name) {
            Ok(trail) => trail,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let dir = match self.walk_to(&trail[..trail.len() - 1]) {
            Ok(dir) => dir,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let name = trail.last().map(String::as_str).unwrap_or_default();
        let outcome = self.rt.block_on(dir.unlink(name, dir_flag));
        self.close_ref(dir);
        match outcome {
            Ok(()) => {
                self.forget_trail(&trail);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merklefs_core::testing::mock_resolver::MockResolver;

    fn sample() -> Arc<MockResolver> {
        let resolver = Arc::new(MockResolver::new());
        resolver.add_dir("/ipfs/QmRoot");
        resolver.add_file("/ipfs/QmRoot/readme", b"hello fuse");
        resolver.add_symlink("/ipfs/QmRoot/link", "readme");
        resolver
    }

    fn host() -> MerkleFuse {
        MerkleFuse::new(sample(), FsConfig::default(), Namespace::Overlay).unwrap()
    }

    #[test]
    fn inode_table_round_trips_trails() {
        let mut fuse = host();
        let trail = vec!["ipfs".to_string(), "QmRoot".to_string()];
        let ino = fuse.get_or_alloc_inode(trail.clone());
        assert_ne!(ino, FUSE_ROOT_ID);
        assert_eq!(fuse.get_or_alloc_inode(trail.clone()), ino);
        assert_eq!(fuse.trail_of(ino), Some(trail));
        assert_eq!(fuse.trail_of(FUSE_ROOT_ID), Some(Vec::new()));
    }

    #[test]
    fn remap_prefix_moves_descendants() {
        let mut fuse = host();
        let dir = fuse.get_or_alloc_inode(vec!["file".into(), "a".into()]);
        let leaf = fuse.get_or_alloc_inode(vec!["file".into(), "a".into(), "x".into()]);
        fuse.remap_prefix(
            &["file".to_string(), "a".to_string()],
            &["file".to_string(), "b".to_string()],
        );
        assert_eq!(fuse.trail_of(dir), Some(vec!["file".into(), "b".into()]));
        assert_eq!(
            fuse.trail_of(leaf),
            Some(vec!["file".into(), "b".into(), "x".into()])
        );
        assert!(!fuse.paths.contains_key(&vec![
            "file".to_string(),
            "a".to_string()
        ]));
    }

    #[test]
    fn walks_resolve_attrs_through_the_overlay() {
        let mut fuse = host();
        let trail = vec![
            "ipfs".to_string(),
            "QmRoot".to_string(),
            "readme".to_string(),
        ];
        let attr = fuse.attr_at(&trail).unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 10);
        assert_eq!(attr.perm, 0o444);

        let missing = fuse.attr_at(&["nope".to_string()]);
        assert_eq!(missing.unwrap_err(), ENOENT);
    }

    #[test]
    fn open_flag_translation_covers_access_modes() {
        let flags = MerkleFuse::open_flags(libc::O_RDONLY).unwrap();
        assert!(flags.read && !flags.write && !flags.truncate);
        let flags = MerkleFuse::open_flags(O_WRONLY | O_TRUNC).unwrap();
        assert!(!flags.read && flags.write && flags.truncate);
        let flags = MerkleFuse::open_flags(O_RDWR).unwrap();
        assert!(flags.read && flags.write);
    }

    #[test]
    fn errno_table_is_total_enough() {
        assert_eq!(errno_of(&FsError::NotFound), ENOENT);
        assert_eq!(errno_of(&FsError::IsADirectory), libc::EISDIR);
        assert_eq!(errno_of(&FsError::InvalidOperation), ENOTSUP);
        assert_eq!(errno_of(&FsError::RenameCycle), EINVAL);
        assert_eq!(
            errno_of(&FsError::NotFound.at("resolve", "/ipfs/Qm")),
            ENOENT
        );
    }
}
