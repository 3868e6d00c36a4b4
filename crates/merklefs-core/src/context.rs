// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Three-level cancellation scopes: process → filesystem → operation.
//!
//! An attach derives a filesystem scope from the long-lived process token;
//! every fork derives an operation scope from the filesystem scope. Canceling
//! an outer scope cancels all scopes derived from it; canceling an operation
//! scope never affects siblings or the filesystem scope.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{FsError, FsResult};

/// Filesystem-scoped cancellation, one per mounted backend instance.
///
/// Canceled on unmount/detach. Cloning shares the same scope.
#[derive(Clone, Debug)]
pub struct FsScope {
    token: CancellationToken,
}

impl FsScope {
    /// Derive a filesystem scope from the process-wide token.
    pub fn attach(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// Derive an operation scope for a freshly forked reference.
    ///
    /// Fails with `Canceled` once the filesystem scope has expired.
    pub fn op_scope(&self) -> FsResult<OpScope> {
        if self.token.is_cancelled() {
            return Err(FsError::Canceled);
        }
        Ok(OpScope {
            token: self.token.child_token(),
        })
    }

    /// Cancel this filesystem instance and every operation under it.
    pub fn detach(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Operation-scoped cancellation, one per reference.
///
/// Canceled when the owning reference is closed.
#[derive(Clone, Debug)]
pub struct OpScope {
    token: CancellationToken,
}

impl OpScope {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Run a resolver-crossing call bounded by the operation scope and the
/// per-call timeout, so a slow backend call can never hang a reference.
pub async fn bounded<T, F>(scope: &OpScope, timeout: Duration, fut: F) -> FsResult<T>
where
    F: Future<Output = FsResult<T>>,
{
    tokio::select! {
        _ = scope.token.cancelled() => Err(FsError::Canceled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(FsError::TimedOut),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outer_cancel_reaches_inner_scopes() {
        let process = CancellationToken::new();
        let fs = FsScope::attach(&process);
        let op = fs.op_scope().unwrap();
        process.cancel();
        assert!(fs.is_cancelled());
        assert!(op.is_cancelled());
    }

    #[tokio::test]
    async fn op_cancel_leaves_siblings_untouched() {
        let process = CancellationToken::new();
        let fs = FsScope::attach(&process);
        let a = fs.op_scope().unwrap();
        let b = fs.op_scope().unwrap();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!fs.is_cancelled());
    }

    #[tokio::test]
    async fn expired_fs_scope_refuses_new_ops() {
        let process = CancellationToken::new();
        let fs = FsScope::attach(&process);
        fs.detach();
        assert!(matches!(fs.op_scope(), Err(FsError::Canceled)));
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let process = CancellationToken::new();
        let fs = FsScope::attach(&process);
        let op = fs.op_scope().unwrap();
        let res: FsResult<()> = bounded(&op, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(FsError::TimedOut)));
    }

    #[tokio::test]
    async fn bounded_observes_cancellation() {
        let process = CancellationToken::new();
        let fs = FsScope::attach(&process);
        let op = fs.op_scope().unwrap();
        let op_clone = op.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            op_clone.cancel();
        });
        let res: FsResult<()> = bounded(&op, Duration::from_secs(30), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(FsError::Canceled)));
    }
}
