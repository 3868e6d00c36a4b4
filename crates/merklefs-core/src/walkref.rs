// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The reference engine: the `WalkRef` contract every backend implements,
//! and the backend-agnostic Walker algorithm that drives a name sequence
//! through it.
//!
//! A reference identifies one location inside one backend. Forking allocates
//! a parallel reference with its own operation scope (`newfid` semantics from
//! walk(5)); stepping advances the current reference one component, possibly
//! returning a reference of a *different* concrete backend (delegation across
//! filesystem boundaries). The Walker never inspects concrete types.

use async_trait::async_trait;
use merklefs_proto::Namespace;

use crate::error::{FsError, FsResult};
use crate::types::{DirectoryEntry, OpenFlags, Qid, Stat, StatMask};

/// Polymorphic per-location reference.
///
/// Backends are variants of one capability set, not a class hierarchy.
/// Operations a backend cannot express fail with `InvalidOperation`, the
/// default provided here.
#[async_trait]
pub trait WalkRef: Send + Sync {
    /// Namespace the reference currently resolves under. Delegated
    /// references report their own backend, not the one they came from.
    fn namespace(&self) -> Namespace;

    /// Allocate a new reference parallel to `self`: same trail, same backend
    /// root, its own operation scope derived from the filesystem scope.
    ///
    /// Fails with `NotInitialized` when no filesystem scope was ever
    /// established and `Canceled` when that scope has expired. Forking is
    /// allowed even while a handle is open on `self`.
    async fn fork(&self) -> FsResult<Box<dyn WalkRef>>;

    /// Advance by one path component. Fails with `NotADirectory` when the
    /// current node is not directory-typed.
    async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>>;

    /// The inverse of `step`, handling `..`. At a backend root this returns
    /// the parent reference when one was set at construction, else the
    /// reference itself (a standalone root is its own parent).
    async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>>;

    /// Resolve the current trail and return its identity. Must not require
    /// the node to be open.
    async fn qid(&self) -> FsResult<Qid>;

    /// `FileOpen` when a handle is currently open on this reference.
    fn check_walk(&self) -> FsResult<()>;

    /// The trail from the backend root to this reference. Synthesized roots
    /// and delegating indexes are always at their root.
    fn trail(&self) -> Vec<String> {
        Vec::new()
    }

    /// st_dev-style identity of the backing tree. Two references can reach
    /// each other through rename only when their devices match. One logical
    /// device per namespace unless the backend refines it (the mutable tree
    /// does, per shared root).
    fn device(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.namespace().name().hash(&mut hasher);
        hasher.finish()
    }

    fn is_closed(&self) -> bool;

    /// Invalidate the reference: release handles, cancel the operation
    /// scope, and release shared backend state when this was the last
    /// reference at a shared root. Double close is a no-op in all merklefs
    /// backends.
    async fn close(&self) -> FsResult<()>;

    async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)>;

    async fn open(&self, _flags: OpenFlags) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Err(FsError::InvalidOperation)
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> FsResult<usize> {
        Err(FsError::InvalidOperation)
    }

    async fn opendir(&self) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn readdir(&self, _offset: u64, _count: usize) -> FsResult<Vec<DirectoryEntry>> {
        Err(FsError::InvalidOperation)
    }

    /// Rewind an open directory stream; equivalent to a fresh `opendir`.
    async fn rewinddir(&self) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn readlink(&self) -> FsResult<String> {
        Err(FsError::InvalidOperation)
    }

    async fn setattr_size(&self, _size: u64) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn create(&self, _name: &str) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn mkdir(&self, _name: &str) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    async fn symlink(&self, _name: &str, _target: &str) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    /// UnlinkAt semantics on a directory reference; `dir` selects rmdir.
    async fn unlink(&self, _name: &str, _dir: bool) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    /// Rename `old_name` under this directory to `new_name` under the
    /// directory at `new_parent` (a trail within the same backend).
    async fn rename(&self, _old_name: &str, _new_parent: &[String], _new_name: &str) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }
}

/// Drive `names` through the reference contract, walk(5)-style.
///
/// Always forks first, so a walk never mutates `origin`. Returns the
/// accumulated per-component identities alongside the outcome; on failure
/// the already accumulated prefix is preserved so callers know how far the
/// walk got. The first failure stops the walk; nothing is retried.
pub async fn walk(
    origin: &dyn WalkRef,
    names: &[&str],
) -> (Vec<Qid>, FsResult<Box<dyn WalkRef>>) {
    if origin.is_closed() {
        return (Vec::new(), Err(FsError::Closed));
    }

    let mut cur = match origin.fork().await {
        Ok(cur) => cur,
        Err(err) => return (Vec::new(), Err(err)),
    };

    // The clone special case: a zero-length walk (or a lone "."/"" name)
    // duplicates the reference without producing identities.
    let is_clone = names.is_empty() || (names.len() == 1 && matches!(names[0], "" | "."));
    if is_clone {
        if let Err(err) = origin.qid().await {
            let _ = cur.close().await;
            return (Vec::new(), Err(err));
        }
        return (Vec::new(), Ok(cur));
    }

    let mut qids = Vec::with_capacity(names.len());
    for name in names {
        let moved = match *name {
            "." => Ok(cur),
            ".." => cur.backtrack().await,
            component => cur.step(component).await,
        };
        cur = match moved {
            Ok(next) => next,
            Err(err) => return (qids, Err(err)),
        };
        match cur.qid().await {
            Ok(qid) => qids.push(qid),
            Err(err) => {
                let _ = cur.close().await;
                return (qids, Err(err));
            }
        }
    }

    (qids, Ok(cur))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::types::QidType;

    /// Minimal in-memory reference for engine-only tests: a fixed tree of
    /// directories keyed by path, no resolver, no handles.
    struct TreeRef {
        tree: Arc<BTreeMap<String, bool>>, // path -> is_dir
        trail: Vec<String>,
        closed: Arc<AtomicBool>,
        open: Arc<AtomicBool>,
    }

    impl TreeRef {
        fn root(paths: &[(&str, bool)]) -> Self {
            let tree = paths
                .iter()
                .map(|(p, d)| (p.to_string(), *d))
                .collect::<BTreeMap<_, _>>();
            Self {
                tree: Arc::new(tree),
                trail: Vec::new(),
                closed: Arc::new(AtomicBool::new(false)),
                open: Arc::new(AtomicBool::new(false)),
            }
        }

        fn path(&self) -> String {
            format!("/{}", self.trail.join("/"))
        }
    }

    #[async_trait]
    impl WalkRef for TreeRef {
        fn namespace(&self) -> Namespace {
            Namespace::Ipfs
        }

        async fn fork(&self) -> FsResult<Box<dyn WalkRef>> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FsError::Closed);
            }
            Ok(Box::new(TreeRef {
                tree: Arc::clone(&self.tree),
                trail: self.trail.clone(),
                closed: Arc::new(AtomicBool::new(false)),
                open: Arc::new(AtomicBool::new(false)),
            }))
        }

        async fn step(self: Box<Self>, name: &str) -> FsResult<Box<dyn WalkRef>> {
            self.check_walk()?;
            let here = self.path();
            if !self.tree.get(here.trim_start_matches('/')).copied().unwrap_or(true) {
                return Err(FsError::NotADirectory);
            }
            let mut next = *self;
            next.trail.push(name.to_string());
            if !next.tree.contains_key(next.path().trim_start_matches('/')) {
                return Err(FsError::NotFound);
            }
            Ok(Box::new(next))
        }

        async fn backtrack(self: Box<Self>) -> FsResult<Box<dyn WalkRef>> {
            let mut back = *self;
            back.trail.pop();
            Ok(Box::new(back))
        }

        async fn qid(&self) -> FsResult<Qid> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FsError::Closed);
            }
            let key = self.path();
            let is_dir = if self.trail.is_empty() {
                true
            } else {
                *self.tree.get(key.trim_start_matches('/')).ok_or(FsError::NotFound)?
            };
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&key, &mut hasher);
            Ok(Qid {
                kind: if is_dir { QidType::Directory } else { QidType::Regular },
                path: std::hash::Hasher::finish(&hasher),
            })
        }

        fn check_walk(&self) -> FsResult<()> {
            if self.open.load(Ordering::SeqCst) {
                return Err(FsError::FileOpen);
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> FsResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn getattr(&self, want: StatMask) -> FsResult<(Stat, StatMask)> {
            Ok(crate::attr::synthesized_dir(want, crate::types::DEFAULT_BLOCK_SIZE))
        }

        async fn open(&self, _flags: OpenFlags) -> FsResult<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample() -> TreeRef {
        TreeRef::root(&[
            ("a", true),
            ("a/b", true),
            ("a/b/c", true),
            ("a/b/file", false),
        ])
    }

    #[tokio::test]
    async fn zero_length_walk_clones_without_qids() {
        let root = sample();
        let (qids, result) = walk(&root, &[]).await;
        assert!(qids.is_empty());
        let clone = result.unwrap();
        assert_eq!(clone.qid().await.unwrap(), root.qid().await.unwrap());
        // Closing the clone must not close the origin.
        clone.close().await.unwrap();
        assert!(!root.is_closed());
        assert!(root.qid().await.is_ok());
    }

    #[tokio::test]
    async fn walk_accumulates_one_qid_per_component() {
        let root = sample();
        let (qids, result) = walk(&root, &["a", "b", "c"]).await;
        assert_eq!(qids.len(), 3);
        result.unwrap();
    }

    #[tokio::test]
    async fn failed_step_preserves_accumulated_prefix() {
        let root = sample();
        let (qids, result) = walk(&root, &["a", "b", "bogus", "d"]).await;
        assert_eq!(qids.len(), 2);
        assert!(matches!(result, Err(FsError::NotFound)));
    }

    #[tokio::test]
    async fn walk_on_closed_origin_fails() {
        let root = sample();
        root.close().await.unwrap();
        let (qids, result) = walk(&root, &["a"]).await;
        assert!(qids.is_empty());
        assert!(matches!(result, Err(FsError::Closed)));
    }

    #[tokio::test]
    async fn dotdot_at_root_stays_at_root() {
        let root = sample();
        let (qids, result) = walk(&root, &["..", "..", ".."]).await;
        assert_eq!(qids.len(), 3);
        let back = result.unwrap();
        assert_eq!(back.qid().await.unwrap(), root.qid().await.unwrap());
    }

    #[tokio::test]
    async fn fork_allowed_while_open_but_step_rejected() {
        let root = sample();
        root.open(OpenFlags::READ).await.unwrap();
        // Fork (and so a walk starting from this ref) still succeeds.
        let (_, result) = walk(&root, &["a"]).await;
        result.unwrap();
        // But stepping the open reference itself is rejected.
        let forked = root.fork().await.unwrap();
        forked.open(OpenFlags::READ).await.unwrap();
        let err = forked.step("a").await.err().unwrap();
        assert!(matches!(err, FsError::FileOpen));
    }

    #[tokio::test]
    async fn dot_components_are_no_ops_with_identity() {
        let root = sample();
        let (qids, result) = walk(&root, &["a", ".", "b"]).await;
        assert_eq!(qids.len(), 3);
        assert_eq!(qids[0], qids[1]);
        result.unwrap();
    }
}
