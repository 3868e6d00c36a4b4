// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory mock of the Content Resolver capability.
//!
//! Backs backend unit tests with a small DAG built by hand, plus simple
//! fault injection: a named operation can be made to fail its next N calls.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{FsError, FsResult};
use crate::resolver::{ChildEntry, ContentFile, ContentResolver, KeyInfo, NodeInfo};
use crate::types::{Cid, NodeKind};

#[derive(Clone, Debug)]
struct MockNode {
    cid: Cid,
    kind: NodeKind,
    data: Vec<u8>,
    target: Option<String>,
    children: Vec<String>,
}

#[derive(Default)]
struct State {
    /// Canonical path (always `/ipfs/...`) → node.
    nodes: HashMap<String, MockNode>,
    /// IPNS name → canonical target path.
    names: HashMap<String, String>,
    /// Key name → target recorded by an explicit `publish` call.
    published: HashMap<String, String>,
    pins: Vec<Cid>,
    keys: Vec<KeyInfo>,
    next_cid: u64,
    /// Operation name → remaining calls to fail.
    faults: HashMap<&'static str, u32>,
}

/// In-memory content resolver.
#[derive(Default)]
pub struct MockResolver {
    state: Mutex<State>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_cid(state: &mut State) -> Cid {
        state.next_cid += 1;
        Cid(format!("Qm{:044}", state.next_cid))
    }

    /// Register a directory at `path` (e.g. `/ipfs/QmRoot/dir`), creating
    /// the parent link when the parent exists.
    pub fn add_dir(&self, path: &str) -> Cid {
        let mut state = self.state.lock().unwrap();
        let cid = Self::fresh_cid(&mut state);
        Self::link_parent(&mut state, path);
        state.nodes.insert(
            path.to_string(),
            MockNode {
                cid: cid.clone(),
                kind: NodeKind::Directory,
                data: Vec::new(),
                target: None,
                children: Vec::new(),
            },
        );
        cid
    }

    pub fn add_file(&self, path: &str, data: &[u8]) -> Cid {
        let mut state = self.state.lock().unwrap();
        let cid = Self::fresh_cid(&mut state);
        Self::link_parent(&mut state, path);
        state.nodes.insert(
            path.to_string(),
            MockNode {
                cid: cid.clone(),
                kind: NodeKind::File,
                data: data.to_vec(),
                target: None,
                children: Vec::new(),
            },
        );
        cid
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> Cid {
        let mut state = self.state.lock().unwrap();
        let cid = Self::fresh_cid(&mut state);
        Self::link_parent(&mut state, path);
        state.nodes.insert(
            path.to_string(),
            MockNode {
                cid: cid.clone(),
                kind: NodeKind::Symlink,
                data: Vec::new(),
                target: Some(target.to_string()),
                children: Vec::new(),
            },
        );
        cid
    }

    fn link_parent(state: &mut State, path: &str) {
        if let Some((parent, name)) = path.rsplit_once('/') {
            if let Some(node) = state.nodes.get_mut(parent) {
                if !node.children.iter().any(|c| c == name) {
                    node.children.push(name.to_string());
                }
            }
        }
    }

    /// Bind an IPNS name to a canonical `/ipfs/...` path.
    pub fn set_name(&self, name: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.names.insert(name.to_string(), target.to_string());
    }

    pub fn pin(&self, cid: &Cid) {
        self.state.lock().unwrap().pins.push(cid.clone());
    }

    pub fn add_key(&self, name: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.keys.push(KeyInfo {
            name: name.to_string(),
            target: target.to_string(),
        });
        state.names.insert(name.to_string(), target.to_string());
    }

    /// Fail the next `count` calls of `op` (`resolve_node`, `get`, `ls`,
    /// `add`, `publish`, `list_pins`, `list_keys`) with an I/O error.
    pub fn fail_next(&self, op: &'static str, count: u32) {
        self.state.lock().unwrap().faults.insert(op, count);
    }

    pub fn published_target(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().published.get(key).cloned()
    }

    fn check_fault(&self, op: &'static str) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.faults.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FsError::Io(std::io::Error::other(format!(
                    "injected {op} failure"
                ))));
            }
        }
        Ok(())
    }

    /// Rewrite `/ipns/<name>/...` through the name table.
    fn canonical(state: &State, path: &str) -> FsResult<String> {
        match path.strip_prefix("/ipns/") {
            Some(rest) => {
                let (name, tail) = match rest.split_once('/') {
                    Some((name, tail)) => (name, Some(tail)),
                    None => (rest, None),
                };
                let base = state.names.get(name).ok_or(FsError::NotFound)?;
                Ok(match tail {
                    Some(tail) => format!("{base}/{tail}"),
                    None => base.clone(),
                })
            }
            None => Ok(path.to_string()),
        }
    }

    /// Clone the node at `src` (and everything below it) to `dst`.
    fn alias_subtree(state: &mut State, src: &str, dst: &str) {
        let Some(node) = state.nodes.get(src).cloned() else {
            return;
        };
        for name in &node.children {
            Self::alias_subtree(state, &format!("{src}/{name}"), &format!("{dst}/{name}"));
        }
        state.nodes.insert(dst.to_string(), node);
    }

    fn lookup(state: &State, path: &str) -> FsResult<MockNode> {
        let canonical = Self::canonical(state, path)?;
        if let Some(node) = state.nodes.get(&canonical) {
            return Ok(node.clone());
        }
        // Hand-built nodes are registered under their test path but are
        // still content: make them addressable by their assigned CID too.
        if let Some(cid) = canonical.strip_prefix("/ipfs/") {
            if !cid.contains('/') {
                if let Some(node) = state.nodes.values().find(|n| n.cid.0 == cid) {
                    return Ok(node.clone());
                }
            }
        }
        Err(FsError::NotFound)
    }
}

struct MockFile {
    data: Vec<u8>,
}

impl ContentFile for MockFile {
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
impl ContentResolver for MockResolver {
    async fn resolve_node(&self, path: &str) -> FsResult<NodeInfo> {
        self.check_fault("resolve_node")?;
        let state = self.state.lock().unwrap();
        let node = Self::lookup(&state, path)?;
        Ok(NodeInfo {
            cid: node.cid,
            kind: node.kind,
            size: node.data.len() as u64,
            blocks: None,
            target: node.target,
        })
    }

    async fn get(&self, path: &str) -> FsResult<Box<dyn ContentFile>> {
        self.check_fault("get")?;
        let state = self.state.lock().unwrap();
        let node = Self::lookup(&state, path)?;
        if node.kind != NodeKind::File {
            return Err(FsError::IsADirectory);
        }
        Ok(Box::new(MockFile { data: node.data }))
    }

    async fn ls(&self, path: &str) -> FsResult<mpsc::Receiver<FsResult<ChildEntry>>> {
        self.check_fault("ls")?;
        let state = self.state.lock().unwrap();
        let node = Self::lookup(&state, path)?;
        if node.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let canonical = Self::canonical(&state, path)?;
        let entries: Vec<FsResult<ChildEntry>> = node
            .children
            .iter()
            .map(|name| {
                let child = Self::lookup(&state, &format!("{canonical}/{name}"))?;
                Ok(ChildEntry {
                    name: name.clone(),
                    cid: child.cid,
                    kind: child.kind,
                    size: child.data.len() as u64,
                })
            })
            .collect();
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        for entry in entries {
            let _ = tx.try_send(entry);
        }
        Ok(rx)
    }

    async fn add(&self, kind: NodeKind, data: &[u8]) -> FsResult<Cid> {
        self.check_fault("add")?;
        let mut state = self.state.lock().unwrap();
        let cid = Self::fresh_cid(&mut state);
        let path = format!("/ipfs/{cid}");
        let mut children = Vec::new();
        if kind == NodeKind::Directory {
            // Re-expose manifest children under the new directory's path so
            // the added subtree resolves like any hand-built one.
            for line in std::str::from_utf8(data).unwrap_or_default().lines() {
                let mut fields = line.splitn(3, ' ');
                let (Some(_), Some(name), Some(child_cid)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    continue;
                };
                Self::alias_subtree(
                    &mut state,
                    &format!("/ipfs/{child_cid}"),
                    &format!("{path}/{name}"),
                );
                children.push(name.to_string());
            }
        }
        let target = (kind == NodeKind::Symlink)
            .then(|| String::from_utf8_lossy(data).into_owned());
        state.nodes.insert(
            path,
            MockNode {
                cid: cid.clone(),
                kind,
                data: data.to_vec(),
                target,
                children,
            },
        );
        Ok(cid)
    }

    async fn publish(&self, key: &str, target: &str) -> FsResult<()> {
        self.check_fault("publish")?;
        let mut state = self.state.lock().unwrap();
        state.names.insert(key.to_string(), target.to_string());
        state.published.insert(key.to_string(), target.to_string());
        for info in state.keys.iter_mut().filter(|k| k.name == key) {
            info.target = target.to_string();
        }
        Ok(())
    }

    async fn list_pins(&self) -> FsResult<Vec<Cid>> {
        self.check_fault("list_pins")?;
        Ok(self.state.lock().unwrap().pins.clone())
    }

    async fn list_keys(&self) -> FsResult<Vec<KeyInfo>> {
        self.check_fault("list_keys")?;
        Ok(self.state.lock().unwrap().keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_through_ipns_indirection() {
        let resolver = MockResolver::new();
        resolver.add_dir("/ipfs/QmRoot");
        resolver.add_file("/ipfs/QmRoot/readme", b"hi");
        resolver.set_name("docs", "/ipfs/QmRoot");
        let node = resolver.resolve_node("/ipns/docs/readme").await.unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.size, 2);
    }

    #[tokio::test]
    async fn fault_injection_is_consumed() {
        let resolver = MockResolver::new();
        resolver.add_dir("/ipfs/QmRoot");
        resolver.fail_next("resolve_node", 1);
        assert!(resolver.resolve_node("/ipfs/QmRoot").await.is_err());
        assert!(resolver.resolve_node("/ipfs/QmRoot").await.is_ok());
    }
}
