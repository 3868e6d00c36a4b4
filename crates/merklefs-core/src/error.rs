// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for MerkleFS Core

use std::io;

/// Core filesystem error type.
///
/// Backends produce these kinds; the 9P and FUSE boundary layers translate
/// them into wire representations with total mapping tables.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("rename would move a directory beneath itself")]
    RenameCycle,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not meaningful for this item")]
    InvalidOperation,
    #[error("reference used before attach")]
    NotInitialized,
    #[error("reference is closed")]
    Closed,
    #[error("walk attempted on an open reference")]
    FileOpen,
    #[error("directory stream already open")]
    AlreadyOpen,
    #[error("offset {offset} extends beyond directory bound {bound}")]
    OffsetBeyondBound { offset: u64, bound: u64 },
    #[error("canceled")]
    Canceled,
    #[error("timed out")]
    TimedOut,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("resolver {op} {path}: {source}")]
    Resolver {
        op: &'static str,
        path: String,
        source: Box<FsError>,
    },
}

impl FsError {
    /// Wrap a resolver failure with the operation and path it came from.
    ///
    /// Lifecycle kinds pass through unwrapped so callers can still match on
    /// cancellation and timeouts.
    pub fn at(self, op: &'static str, path: &str) -> FsError {
        match self {
            FsError::Canceled | FsError::TimedOut => self,
            other => FsError::Resolver {
                op,
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying kind, unwrapping resolver context.
    pub fn kind(&self) -> &FsError {
        match self {
            FsError::Resolver { source, .. } => source.kind(),
            other => other,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_wraps_with_context() {
        let err = FsError::NotFound.at("resolve", "/ipfs/QmMissing");
        assert!(matches!(err.kind(), FsError::NotFound));
        let text = err.to_string();
        assert!(text.contains("resolve"));
        assert!(text.contains("/ipfs/QmMissing"));
    }

    #[test]
    fn at_passes_lifecycle_kinds_through() {
        assert!(matches!(
            FsError::Canceled.at("ls", "/ipfs/Qm"),
            FsError::Canceled
        ));
        assert!(matches!(
            FsError::TimedOut.at("ls", "/ipfs/Qm"),
            FsError::TimedOut
        ));
    }
}
