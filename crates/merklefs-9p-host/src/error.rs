// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side error shapes and the total FsError → errno table.
//!
//! 9P2000.L Rlerror carries a Linux errno; the table below is total, with
//! unknown kinds collapsing to EIO.

use merklefs_core::error::FsError;

/// Session-level failures: fid bookkeeping plus anything the core reports.
#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("unknown fid {0}")]
    UnknownFid(u32),
    #[error("fid {0} already in use")]
    FidInUse(u32),
    #[error("rename across trees")]
    CrossDevice,
    #[error(transparent)]
    Fs(#[from] FsError),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    /// Linux errno for the Rlerror ecode field.
    pub fn ecode(&self) -> i32 {
        match self {
            HostError::UnknownFid(_) | HostError::FidInUse(_) => libc::EBADF,
            HostError::CrossDevice => libc::EXDEV,
            HostError::Fs(err) => errno_of(err),
        }
    }
}

/// Total mapping from core error kinds to errno.
pub fn errno_of(err: &FsError) -> i32 {
    match err.kind() {
        FsError::NotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::IsADirectory => libc::EISDIR,
        FsError::NotADirectory => libc::ENOTDIR,
        FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
        FsError::RenameCycle => libc::EINVAL,
        FsError::AccessDenied => libc::EACCES,
        FsError::InvalidOperation => libc::EOPNOTSUPP,
        FsError::NotInitialized => libc::EIO,
        FsError::Closed => libc::EBADF,
        FsError::FileOpen | FsError::AlreadyOpen => libc::EBUSY,
        FsError::OffsetBeyondBound { .. } => libc::EINVAL,
        FsError::Canceled => libc::EINTR,
        FsError::TimedOut => libc::ETIMEDOUT,
        FsError::Io(_) => libc::EIO,
        // kind() strips resolver context, but the match must stay total.
        FsError::Resolver { .. } => libc::EIO,
    }
}
