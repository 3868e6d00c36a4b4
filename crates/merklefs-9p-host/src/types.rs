// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L wire shapes: qids, directory entries, attribute structures and
//! the getattr/setattr masks, plus the open-flag translation. Byte-level
//! (de)serialization belongs to the transport driving the session.

use merklefs_core::error::{FsError, FsResult};
use merklefs_core::types::{OpenFlags, Qid, QidType, Stat, StatMask};

pub const QTFILE: u8 = 0x00;
pub const QTSYMLINK: u8 = 0x02;
pub const QTDIR: u8 = 0x80;

/// walk(5) qid: server-unique identity of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Qid9 {
    pub typ: u8,
    pub version: u32,
    pub path: u64,
}

impl From<Qid> for Qid9 {
    fn from(qid: Qid) -> Self {
        let typ = match qid.kind {
            QidType::Directory => QTDIR,
            QidType::Symlink => QTSYMLINK,
            QidType::Regular => QTFILE,
        };
        // Content-addressed nodes never change under one identity.
        Qid9 {
            typ,
            version: 0,
            path: qid.path,
        }
    }
}

// Tgetattr request_mask / Rgetattr valid bits.
pub const GETATTR_MODE: u64 = 0x0000_0001;
pub const GETATTR_NLINK: u64 = 0x0000_0002;
pub const GETATTR_UID: u64 = 0x0000_0004;
pub const GETATTR_GID: u64 = 0x0000_0008;
pub const GETATTR_RDEV: u64 = 0x0000_0010;
pub const GETATTR_ATIME: u64 = 0x0000_0020;
pub const GETATTR_MTIME: u64 = 0x0000_0040;
pub const GETATTR_CTIME: u64 = 0x0000_0080;
pub const GETATTR_INO: u64 = 0x0000_0100;
pub const GETATTR_SIZE: u64 = 0x0000_0200;
pub const GETATTR_BLOCKS: u64 = 0x0000_0400;
pub const GETATTR_BASIC: u64 = 0x0000_07ff;

// Tsetattr valid bits (only size is meaningful here).
pub const SETATTR_SIZE: u64 = 0x0000_0008;

/// Rgetattr payload. Fields outside `valid` are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr9 {
    pub valid: u64,
    pub qid: Qid9,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
}

impl Default for Qid9 {
    fn default() -> Self {
        Qid9 {
            typ: QTFILE,
            version: 0,
            path: 0,
        }
    }
}

// File-type bits of the mode field (mode_t layout).
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Build the Rgetattr payload from a translated stat.
///
/// Permission bits are synthesized: the store carries no ownership model, so
/// everything is world-readable and writability follows the namespace.
pub fn attr_of(stat: &Stat, filled: StatMask, qid: Qid9, writable: bool) -> Attr9 {
    use merklefs_core::types::NodeKind;

    let mut attr = Attr9 {
        qid,
        blksize: stat.block_size as u64,
        ..Attr9::default()
    };
    if filled.kind {
        attr.valid |= GETATTR_MODE | GETATTR_NLINK;
        attr.nlink = 1;
        attr.mode = match stat.kind {
            NodeKind::Directory => S_IFDIR | if writable { 0o775 } else { 0o555 },
            NodeKind::File => S_IFREG | if writable { 0o664 } else { 0o444 },
            NodeKind::Symlink => S_IFLNK | 0o777,
        };
    }
    if filled.size {
        attr.valid |= GETATTR_SIZE;
        attr.size = stat.size;
    }
    if filled.blocks {
        attr.valid |= GETATTR_BLOCKS;
        attr.blocks = stat.blocks;
    }
    attr
}

/// Translate a Tgetattr request mask into the protocol-neutral want mask.
pub fn want_of(request_mask: u64) -> StatMask {
    StatMask {
        kind: request_mask & (GETATTR_MODE | GETATTR_NLINK) != 0,
        size: request_mask & GETATTR_SIZE != 0,
        blocks: request_mask & GETATTR_BLOCKS != 0,
    }
}

// dirent d_type values carried in Rreaddir.
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

/// One Rreaddir entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent9 {
    pub qid: Qid9,
    /// Resume token: pass back to continue after this entry.
    pub offset: u64,
    pub typ: u8,
    pub name: String,
}

// Lopen/Lcreate flag bits (Linux openat flags on the wire).
pub const L_O_WRONLY: u32 = 0o1;
pub const L_O_RDWR: u32 = 0o2;
pub const L_O_ACCMODE: u32 = 0o3;
pub const L_O_TRUNC: u32 = 0o1000;

/// Translate Lopen flags. Unknown access modes are rejected.
pub fn open_flags(l_flags: u32) -> FsResult<OpenFlags> {
    let (read, write) = match l_flags & L_O_ACCMODE {
        0 => (true, false),
        L_O_WRONLY => (false, true),
        L_O_RDWR => (true, true),
        _ => return Err(FsError::InvalidOperation),
    };
    Ok(OpenFlags {
        read,
        write,
        truncate: l_flags & L_O_TRUNC != 0,
    })
}

/// Rstatfs payload, synthesized: the store exposes no capacity accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatFs9 {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

impl StatFs9 {
    pub fn synthesized(block_size: u32, fsid: u64) -> Self {
        StatFs9 {
            typ: 0x01021997, // V9FS_MAGIC
            bsize: block_size,
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            fsid,
            namelen: 255,
        }
    }
}
