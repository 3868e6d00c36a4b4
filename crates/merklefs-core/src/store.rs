// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Disk-backed reference implementation of the Content Resolver.
//!
//! One flat `blocks/` directory of content-addressed nodes plus a small JSON
//! state file for names, keys, and pins. Identifiers are `b3` followed by a
//! kind tag (`f`, `d`, `l`) and the hex blake3 digest of the node bytes, so
//! a node's kind is recoverable from its identifier alone. Directories are
//! the same `kind name cid` manifest lines the mutable tree flushes.
//!
//! This exists so the host binaries run against something real without a
//! full object store behind them; anything heavier plugs in through the
//! [`ContentResolver`] trait instead.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::resolver::{ChildEntry, ContentFile, ContentResolver, KeyInfo, NodeInfo};
use crate::types::{Cid, NodeKind, DEFAULT_BLOCK_SIZE};

#[derive(Default, Serialize, Deserialize)]
struct DiskState {
    /// Mutable name bindings, IPNS-style: name -> `/ipfs/...` target.
    names: std::collections::HashMap<String, String>,
    keys: Vec<KeyEntry>,
    pins: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct KeyEntry {
    name: String,
    target: String,
}

/// Content resolver over a local directory.
pub struct DiskResolver {
    root: PathBuf,
    state: Mutex<DiskState>,
}

fn kind_char(kind: NodeKind) -> char {
    match kind {
        NodeKind::File => 'f',
        NodeKind::Directory => 'd',
        NodeKind::Symlink => 'l',
    }
}

fn kind_of(cid: &str) -> FsResult<NodeKind> {
    match cid.as_bytes().get(2) {
        Some(b'f') => Ok(NodeKind::File),
        Some(b'd') => Ok(NodeKind::Directory),
        Some(b'l') => Ok(NodeKind::Symlink),
        _ => Err(FsError::NotFound),
    }
}

/// One parsed `kind name cid` manifest line.
struct ManifestEntry {
    kind: NodeKind,
    name: String,
    cid: String,
}

fn parse_manifest(data: &[u8]) -> Vec<ManifestEntry> {
    std::str::from_utf8(data)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ' ');
            let kind = match fields.next() {
                Some("d") => NodeKind::Directory,
                Some("f") => NodeKind::File,
                Some("l") => NodeKind::Symlink,
                _ => return None,
            };
            Some(ManifestEntry {
                kind,
                name: fields.next()?.to_string(),
                cid: fields.next()?.to_string(),
            })
        })
        .collect()
}

impl DiskResolver {
    /// Open (or initialize) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> FsResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blocks")).map_err(FsError::Io)?;
        let state = match fs::read(root.join("state.json")) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| FsError::Io(std::io::Error::other(e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DiskState::default(),
            Err(e) => return Err(FsError::Io(e)),
        };
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    fn block_path(&self, cid: &str) -> PathBuf {
        self.root.join("blocks").join(cid)
    }

    fn read_block(&self, cid: &str) -> FsResult<Vec<u8>> {
        match fs::read(self.block_path(cid)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn write_block(&self, kind: NodeKind, data: &[u8]) -> FsResult<Cid> {
        let digest = blake3::hash(data);
        let cid = format!("b3{}{}", kind_char(kind), hex::encode(digest.as_bytes()));
        let path = self.block_path(&cid);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, data).map_err(FsError::Io)?;
            fs::rename(&tmp, &path).map_err(FsError::Io)?;
        }
        Ok(Cid(cid))
    }

    fn save_state(&self, state: &DiskState) -> FsResult<()> {
        let bytes =
            serde_json::to_vec_pretty(state).map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        let path = self.root.join("state.json");
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(FsError::Io)?;
        fs::rename(&tmp, &path).map_err(FsError::Io)?;
        Ok(())
    }

    /// Walk an abstract path down to the identifier it names.
    fn locate(&self, path: &str) -> FsResult<String> {
        let (root_cid, rest) = if let Some(rest) = path.strip_prefix("/ipfs/") {
            let (cid, tail) = match rest.split_once('/') {
                Some((cid, tail)) => (cid.to_string(), tail),
                None => (rest.to_string(), ""),
            };
            (cid, tail)
        } else if let Some(rest) = path.strip_prefix("/ipns/") {
            let (name, tail) = match rest.split_once('/') {
                Some((name, tail)) => (name, tail),
                None => (rest, ""),
            };
            let target = {
                let state = self.state.lock().unwrap();
                state.names.get(name).cloned().ok_or(FsError::NotFound)?
            };
            (self.locate(&target)?, tail)
        } else {
            return Err(FsError::NotFound);
        };
        let mut cid = root_cid;
        for name in rest.split('/').filter(|s| !s.is_empty()) {
            if kind_of(&cid)? != NodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            let manifest = parse_manifest(&self.read_block(&cid)?);
            cid = manifest
                .into_iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.cid)
                .ok_or(FsError::NotFound)?;
        }
        Ok(cid)
    }

    fn block_size_of(&self, cid: &str) -> FsResult<u64> {
        match fs::metadata(self.block_path(cid)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    /// Register a new key pointing at an empty directory.
    pub fn create_key(&self, name: &str) -> FsResult<Cid> {
        let empty = self.write_block(NodeKind::Directory, b"")?;
        let target = format!("/ipfs/{empty}");
        let mut state = self.state.lock().unwrap();
        if state.keys.iter().any(|k| k.name == name) {
            return Err(FsError::AlreadyExists);
        }
        state.keys.push(KeyEntry {
            name: name.to_string(),
            target: target.clone(),
        });
        state.names.insert(name.to_string(), target);
        self.save_state(&state)?;
        Ok(empty)
    }

    /// Pin a root so it shows up under the pin namespace.
    pub fn pin(&self, cid: &Cid) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.pins.iter().any(|p| p == &cid.0) {
            state.pins.push(cid.0.clone());
            self.save_state(&state)?;
        }
        Ok(())
    }
}

struct DiskFile {
    data: Vec<u8>,
}

impl ContentFile for DiskFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[async_trait]
impl ContentResolver for DiskResolver {
    async fn resolve_node(&self, path: &str) -> FsResult<NodeInfo> {
        let cid = self.locate(path)?;
        let kind = kind_of(&cid)?;
        let size = match kind {
            NodeKind::File => self.block_size_of(&cid)?,
            _ => 0,
        };
        let target = match kind {
            NodeKind::Symlink => Some(
                String::from_utf8_lossy(&self.read_block(&cid)?).into_owned(),
            ),
            _ => None,
        };
        let blocks = match kind {
            NodeKind::File => Some(size.div_ceil(u64::from(DEFAULT_BLOCK_SIZE)).max(1)),
            _ => None,
        };
        Ok(NodeInfo {
            cid: Cid(cid),
            kind,
            size,
            blocks,
            target,
        })
    }

    async fn get(&self, path: &str) -> FsResult<Box<dyn ContentFile>> {
        let cid = self.locate(path)?;
        if kind_of(&cid)? != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        Ok(Box::new(DiskFile {
            data: self.read_block(&cid)?,
        }))
    }

    async fn ls(&self, path: &str) -> FsResult<mpsc::Receiver<FsResult<ChildEntry>>> {
        let cid = self.locate(path)?;
        if kind_of(&cid)? != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let entries = parse_manifest(&self.read_block(&cid)?);
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        for entry in entries {
            let size = match entry.kind {
                NodeKind::File => self.block_size_of(&entry.cid).unwrap_or(0),
                _ => 0,
            };
            let _ = tx.try_send(Ok(ChildEntry {
                name: entry.name,
                cid: Cid(entry.cid),
                kind: entry.kind,
                size,
            }));
        }
        Ok(rx)
    }

    async fn add(&self, kind: NodeKind, data: &[u8]) -> FsResult<Cid> {
        self.write_block(kind, data)
    }

    async fn publish(&self, key: &str, target: &str) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.names.insert(key.to_string(), target.to_string());
        for entry in state.keys.iter_mut().filter(|k| k.name == key) {
            entry.target = target.to_string();
        }
        self.save_state(&state)?;
        debug!(key = %key, target = %target, "published name");
        Ok(())
    }

    async fn list_pins(&self) -> FsResult<Vec<Cid>> {
        let state = self.state.lock().unwrap();
        Ok(state.pins.iter().cloned().map(Cid).collect())
    }

    async fn list_keys(&self) -> FsResult<Vec<KeyInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .keys
            .iter()
            .map(|k| KeyInfo {
                name: k.name.clone(),
                target: k.target.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn sample(store: &DiskResolver) -> Cid {
        let file = store.add(NodeKind::File, b"hello disk").await.unwrap();
        let link = store.add(NodeKind::Symlink, b"file").await.unwrap();
        let manifest = format!("f file {file}\nl link {link}\n");
        store
            .add(NodeKind::Directory, manifest.as_bytes())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_paths_through_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskResolver::open(dir.path()).unwrap();
        let root = sample(&store).await;

        let node = store
            .resolve_node(&format!("/ipfs/{root}/file"))
            .await
            .unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.size, 10);
        assert_eq!(node.blocks, Some(1));

        let link = store
            .resolve_node(&format!("/ipfs/{root}/link"))
            .await
            .unwrap();
        assert_eq!(link.target.as_deref(), Some("file"));

        let mut handle = store.get(&format!("/ipfs/{root}/file")).await.unwrap();
        let mut buf = [0u8; 16];
        let n = handle.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello disk");
    }

    #[tokio::test]
    async fn listing_reports_child_kinds_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskResolver::open(dir.path()).unwrap();
        let root = sample(&store).await;

        let mut rx = store.ls(&format!("/ipfs/{root}")).await.unwrap();
        let mut names = Vec::new();
        while let Some(item) = rx.recv().await {
            let entry = item.unwrap();
            if entry.name == "file" {
                assert_eq!(entry.size, 10);
            }
            names.push(entry.name);
        }
        assert_eq!(names, ["file", "link"]);
    }

    #[tokio::test]
    async fn names_and_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = {
            let store = DiskResolver::open(dir.path()).unwrap();
            let root = sample(&store).await;
            store.create_key("site").unwrap();
            store
                .publish("site", &format!("/ipfs/{root}"))
                .await
                .unwrap();
            store.pin(&root).unwrap();
            root
        };

        let store = DiskResolver::open(dir.path()).unwrap();
        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].target, format!("/ipfs/{root}"));
        assert_eq!(store.list_pins().await.unwrap(), vec![root.clone()]);

        let node = store.resolve_node("/ipns/site/file").await.unwrap();
        assert_eq!(node.kind, NodeKind::File);
    }

    #[tokio::test]
    async fn duplicate_content_shares_one_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskResolver::open(dir.path()).unwrap();
        let a = store.add(NodeKind::File, b"same").await.unwrap();
        let b = store.add(NodeKind::File, b"same").await.unwrap();
        assert_eq!(a, b);
        // Same bytes under a different kind is a different node.
        let c = store.add(NodeKind::Symlink, b"same").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn mutable_tree_round_trips_through_the_store() {
        use crate::backends::keyfs::KeyRef;
        use crate::types::{FsConfig, OpenFlags, QidSalt};
        use crate::walkref::walk;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskResolver::open(dir.path()).unwrap());
        let root_cid = sample(&*store).await;
        store.create_key("notes").unwrap();
        store
            .publish("notes", &format!("/ipfs/{root_cid}"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let root = KeyRef::attach(
            store.clone() as Arc<dyn ContentResolver>,
            FsConfig::default(),
            QidSalt::generate(),
            &token,
        )
        .unwrap();

        let (_, tree) = walk(&root, &["notes"]).await;
        let tree = tree.unwrap();
        tree.create("extra").await.unwrap();
        let (_, extra) = walk(&root, &["notes", "extra"]).await;
        let extra = extra.unwrap();
        extra
            .open(OpenFlags {
                read: false,
                write: true,
                truncate: false,
            })
            .await
            .unwrap();
        extra.write_at(0, b"new note").await.unwrap();
        extra.close().await.unwrap();
        tree.close().await.unwrap();

        // The last close flushed the tree and republished the key; the new
        // content resolves straight from disk.
        let node = store.resolve_node("/ipns/notes/extra").await.unwrap();
        assert_eq!(node.size, 8);
        let kept = store.resolve_node("/ipns/notes/file").await.unwrap();
        assert_eq!(kept.size, 10);
    }
}
