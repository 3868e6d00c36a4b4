// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MerkleFS Core — protocol-neutral reference engine over a
//! content-addressed object graph
//!
//! The central abstraction is the [`WalkRef`](walkref::WalkRef): a movable
//! reference into one backend namespace, driven by host adapters (9P, FUSE)
//! through fork/step/backtrack and the handle operations. Backends plug in
//! via [`ContentResolver`](resolver::ContentResolver); the composed root
//! lives in [`backends::overlay`].

pub mod attr;
pub mod backends;
pub mod context;
pub mod error;
pub mod resolver;
pub mod store;
pub mod stream;
pub mod types;
pub mod walkref;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{FsError, FsResult};
pub use resolver::{ChildEntry, ContentFile, ContentResolver, KeyInfo, NodeInfo};
pub use store::DiskResolver;
pub use types::{
    Cid, DEFAULT_BLOCK_SIZE, DirectoryEntry, FsConfig, NodeKind, OpenFlags, Qid, QidSalt,
    QidType, Stat, StatMask,
};
pub use walkref::{WalkRef, walk};
