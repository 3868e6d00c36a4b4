// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Indirected namespace adapter: mutable pointer → immutable root.
//!
//! Mechanically identical to the immutable adapter; names resolve through
//! one extra indirection (name → current root) inside the content resolver
//! before falling into the same code path. Implemented as the immutable
//! adapter parameterized by the `/ipns` prefix.

use std::sync::Arc;
use std::sync::Weak;

use tokio_util::sync::CancellationToken;

use crate::context::FsScope;
use crate::error::FsResult;
use crate::resolver::ContentResolver;
use crate::types::{FsConfig, QidSalt};
use crate::walkref::WalkRef;
use merklefs_proto::Namespace;

use super::ipfs::ImmutableRef;

/// Bind a fresh reference to the indirected namespace root.
pub fn attach(
    resolver: Arc<dyn ContentResolver>,
    config: FsConfig,
    salt: QidSalt,
    parent: &CancellationToken,
) -> FsResult<ImmutableRef> {
    ImmutableRef::attach(resolver, config, Namespace::Ipns, salt, parent)
}

pub(crate) fn attach_scoped(
    resolver: Arc<dyn ContentResolver>,
    config: FsConfig,
    salt: QidSalt,
    fs: FsScope,
    parent: Option<Weak<dyn WalkRef>>,
) -> FsResult<ImmutableRef> {
    ImmutableRef::attach_scoped(resolver, config, Namespace::Ipns, salt, fs, parent)
}
