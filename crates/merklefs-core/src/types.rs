// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for MerkleFS

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default UnixFS block size used for block accounting.
pub const DEFAULT_BLOCK_SIZE: u32 = 256 << 10;

/// Content identifier: the hash-derived address of an immutable object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cid(pub String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved node type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
}

/// QID type tag, mirroring the 9P type bits a host will emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QidType {
    Directory,
    Symlink,
    Regular,
}

impl From<NodeKind> for QidType {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Directory => QidType::Directory,
            NodeKind::Symlink => QidType::Symlink,
            NodeKind::File => QidType::Regular,
        }
    }
}

/// Backend-derived identity for a resolved node: a type tag plus a 64-bit
/// hash of the node's content identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Qid {
    pub kind: QidType,
    pub path: u64,
}

/// Per-process salt mixed into QID path hashes.
///
/// Two references resolving to the same content identifier yield the same
/// QID within one process lifetime; QIDs are deliberately not stable across
/// processes, so identical content cannot be linked between restarts.
#[derive(Clone, Copy, Debug)]
pub struct QidSalt(u64);

impl QidSalt {
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let mut hasher = DefaultHasher::new();
        now.as_nanos().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Derive the QID for `cid` with the given type tag.
    pub fn qid_for(&self, kind: QidType, cid: &Cid) -> Qid {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        cid.0.hash(&mut hasher);
        Qid {
            kind,
            path: hasher.finish(),
        }
    }

    /// Synthesized QID for roots with no backing content (pin index, key
    /// index, overlay). Distinct per label, stable within the process.
    pub fn synthetic_dir(&self, label: &str) -> Qid {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        label.hash(&mut hasher);
        Qid {
            kind: QidType::Directory,
            path: hasher.finish(),
        }
    }
}

/// Protocol-neutral attribute tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub kind: NodeKind,
    pub size: u64,
    pub block_size: u32,
    pub blocks: u64,
}

/// Which `Stat` fields a caller requested, and which a backend filled.
///
/// Not every backend can supply every field; callers must consult the
/// returned mask rather than assume completeness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatMask {
    pub kind: bool,
    pub size: bool,
    pub blocks: bool,
}

impl StatMask {
    pub const ALL: StatMask = StatMask {
        kind: true,
        size: true,
        blocks: true,
    };

    pub fn contains(&self, other: &StatMask) -> bool {
        (self.kind || !other.kind) && (self.size || !other.size) && (self.blocks || !other.blocks)
    }
}

/// Protocol-neutral directory entry.
///
/// `offset` is an opaque resume token, monotonically increasing from 1
/// within one listing session; it is not stable across independent listings
/// of a mutated backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub offset: u64,
    pub kind: NodeKind,
    pub qid: Qid,
}

/// File open disposition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        truncate: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        truncate: false,
    };
}

/// Core configuration shared by all backends attached to one node.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Block size reported in attribute translation and statfs.
    pub block_size: u32,
    /// Upper bound for any single resolver call.
    pub call_timeout: Duration,
    /// Bound of the directory-stream channel between producer and consumer.
    pub stream_depth: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            call_timeout: Duration::from_secs(30),
            stream_depth: 64,
        }
    }
}
