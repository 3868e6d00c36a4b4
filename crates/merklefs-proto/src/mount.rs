// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stacked mount-point encoding.
//!
//! A mount target is written as stacked protocol components, outermost first:
//! the host API, the namespace it exposes, and the host location (a mount
//! path for FUSE, a socket path or listen address for 9P). Examples:
//!
//! ```text
//! /fuse/ipfs/path/mnt/ipfs
//! /9p/overlay/unix/run/merklefs.sock
//! ```

use serde::{Deserialize, Serialize};

use crate::{HostApi, Namespace};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MountPointError {
    #[error("empty mount point")]
    Empty,
    #[error("unknown host api: {0}")]
    UnknownApi(String),
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),
    #[error("unknown target component: {0}")]
    UnknownTarget(String),
    #[error("missing target component")]
    MissingTarget,
}

/// Host location component of a mount point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Filesystem path on the host (FUSE mount point).
    Path(String),
    /// Unix domain socket path (9P listener).
    Unix(String),
    /// TCP listen address (9P listener).
    Tcp(String),
}

impl Target {
    fn component(&self) -> &'static str {
        match self {
            Target::Path(_) => "path",
            Target::Unix(_) => "unix",
            Target::Tcp(_) => "tcp",
        }
    }

    fn value(&self) -> &str {
        match self {
            Target::Path(v) | Target::Unix(v) | Target::Tcp(v) => v,
        }
    }
}

/// A fully specified mount target: host API × namespace × host location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub api: HostApi,
    pub namespace: Namespace,
    pub target: Target,
}

impl MountPoint {
    pub fn new(api: HostApi, namespace: Namespace, target: Target) -> Self {
        Self {
            api,
            namespace,
            target,
        }
    }
}

impl std::fmt::Display for MountPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.api,
            self.namespace,
            self.target.component(),
            self.target.value().trim_start_matches('/')
        )
    }
}

impl std::str::FromStr for MountPoint {
    type Err = MountPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim_start_matches('/').splitn(4, '/');
        let api: HostApi = parts.next().filter(|p| !p.is_empty()).ok_or(MountPointError::Empty)?.parse()?;
        let namespace: Namespace =
            parts.next().ok_or(MountPointError::MissingTarget)?.parse()?;
        let component = parts.next().ok_or(MountPointError::MissingTarget)?;
        let value = parts.next().ok_or(MountPointError::MissingTarget)?;
        let target = match component {
            // Host locations are absolute; the leading slash is implied by the encoding.
            "path" => Target::Path(format!("/{value}")),
            "unix" => Target::Unix(format!("/{value}")),
            "tcp" => Target::Tcp(value.to_string()),
            other => return Err(MountPointError::UnknownTarget(other.to_string())),
        };
        Ok(MountPoint {
            api,
            namespace,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fuse_path_mount() {
        let mp: MountPoint = "/fuse/ipfs/path/mnt/ipfs".parse().unwrap();
        assert_eq!(mp.api, HostApi::Fuse);
        assert_eq!(mp.namespace, Namespace::Ipfs);
        assert_eq!(mp.target, Target::Path("/mnt/ipfs".to_string()));
    }

    #[test]
    fn parse_9p_unix_mount() {
        let mp: MountPoint = "/9p/overlay/unix/run/merklefs.sock".parse().unwrap();
        assert_eq!(mp.api, HostApi::NineP);
        assert_eq!(mp.namespace, Namespace::Overlay);
        assert_eq!(mp.target, Target::Unix("/run/merklefs.sock".to_string()));
    }

    #[test]
    fn display_round_trips() {
        for raw in [
            "/fuse/ipfs/path/mnt/ipfs",
            "/fuse/overlay/path/mnt/dag",
            "/9p/keyfs/unix/tmp/keys.sock",
            "/9p/pinfs/tcp/127.0.0.1:564",
        ] {
            let mp: MountPoint = raw.parse().unwrap();
            assert_eq!(mp.to_string(), raw);
            let again: MountPoint = mp.to_string().parse().unwrap();
            assert_eq!(again, mp);
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<MountPoint>().is_err());
        assert!("/nfs/ipfs/path/x".parse::<MountPoint>().is_err());
        assert!("/fuse/bogus/path/x".parse::<MountPoint>().is_err());
        assert!("/fuse/ipfs".parse::<MountPoint>().is_err());
        assert!("/fuse/ipfs/floppy/x".parse::<MountPoint>().is_err());
    }
}
