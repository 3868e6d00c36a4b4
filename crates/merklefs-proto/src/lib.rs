// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MerkleFS Protocol — control-plane types shared by hosts and the daemon
//!
//! This crate defines the namespace and host-API identifiers, the stacked
//! mount-point encoding, and the explicit host-API registry used to describe
//! "mount this node namespace at this host location".

pub mod mount;
pub mod registry;

pub use mount::{MountPoint, MountPointError, Target};
pub use registry::{ApiEntry, HostRegistry};

use serde::{Deserialize, Serialize};

/// Namespace selector for a mount/attach target.
///
/// Each variant names one backend of the object graph; `prefix` is the
/// path prefix the backend resolves under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Immutable content-addressed tree.
    Ipfs,
    /// Mutable-pointer indirection over immutable content.
    Ipns,
    /// Writable path-addressed tree of content-addressed blocks.
    Files,
    /// View of currently pinned roots.
    PinFs,
    /// View of named signing keys.
    KeyFs,
    /// Composed root mapping top-level names to the other namespaces.
    Overlay,
}

impl Namespace {
    /// Path prefix used when resolving through the content resolver.
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Ipfs => "/ipfs",
            Namespace::Ipns => "/ipns",
            Namespace::Files => "/file",
            Namespace::PinFs => "/pinfs",
            Namespace::KeyFs => "/keyfs",
            Namespace::Overlay => "/",
        }
    }

    /// Name used in mount-point encodings and overlay listings.
    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Ipfs => "ipfs",
            Namespace::Ipns => "ipns",
            Namespace::Files => "file",
            Namespace::PinFs => "pinfs",
            Namespace::KeyFs => "keyfs",
            Namespace::Overlay => "overlay",
        }
    }

    /// Whether the namespace accepts mutating operations.
    pub fn writable(&self) -> bool {
        matches!(self, Namespace::Files | Namespace::KeyFs)
    }

    /// The fixed set of mountable namespaces, in overlay listing order.
    pub const ALL: [Namespace; 5] = [
        Namespace::Ipfs,
        Namespace::Ipns,
        Namespace::Files,
        Namespace::PinFs,
        Namespace::KeyFs,
    ];
}

impl std::str::FromStr for Namespace {
    type Err = MountPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipfs" => Ok(Namespace::Ipfs),
            "ipns" => Ok(Namespace::Ipns),
            "file" | "files" => Ok(Namespace::Files),
            "pinfs" => Ok(Namespace::PinFs),
            "keyfs" => Ok(Namespace::KeyFs),
            "overlay" => Ok(Namespace::Overlay),
            other => Err(MountPointError::UnknownNamespace(other.to_string())),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Host-side API used to expose a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostApi {
    /// FUSE kernel binding.
    Fuse,
    /// 9P2000.L protocol surface.
    NineP,
}

impl HostApi {
    pub fn name(&self) -> &'static str {
        match self {
            HostApi::Fuse => "fuse",
            HostApi::NineP => "9p",
        }
    }
}

impl std::str::FromStr for HostApi {
    type Err = MountPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fuse" => Ok(HostApi::Fuse),
            "9p" | "ninep" => Ok(HostApi::NineP),
            other => Err(MountPointError::UnknownApi(other.to_string())),
        }
    }
}

impl std::fmt::Display for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_prefixes_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for ns in Namespace::ALL {
            assert!(seen.insert(ns.prefix()), "duplicate prefix {}", ns.prefix());
        }
    }

    #[test]
    fn namespace_round_trips_through_name() {
        for ns in Namespace::ALL {
            let parsed: Namespace = ns.name().parse().unwrap();
            assert_eq!(parsed, ns);
        }
    }

    #[test]
    fn only_files_and_keyfs_are_writable() {
        assert!(Namespace::Files.writable());
        assert!(Namespace::KeyFs.writable());
        assert!(!Namespace::Ipfs.writable());
        assert!(!Namespace::PinFs.writable());
    }
}
