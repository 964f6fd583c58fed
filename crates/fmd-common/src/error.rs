//! Error types for the replica metadata engine
//!
//! This module defines the cross-crate error taxonomy: identity,
//! consistency, transient and structural failures.

use crate::types::{FileId, FsId};
use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type
#[derive(Debug, Error)]
pub enum Error {
    // Identity errors
    #[error("file id 0 is never valid")]
    ZeroFileId,

    #[error("identity mismatch: requested {fid:08x}/{fsid}, stored {stored_fid:08x}/{stored_fsid}")]
    IdentityMismatch {
        fid: FileId,
        fsid: FsId,
        stored_fid: FileId,
        stored_fsid: FsId,
    },

    // Consistency errors
    #[error("record {fid:08x} on fsid {fsid} is inconsistent: {reason}")]
    Inconsistent {
        fid: FileId,
        fsid: FsId,
        reason: String,
    },

    #[error("record {fid:08x} not found on fsid {fsid}")]
    RecordNotFound { fid: FileId, fsid: FsId },

    // Transient errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("namespace request failed with transient status {code}: {message}")]
    Transient { code: u16, message: String },

    #[error("request timeout")]
    Timeout,

    // Structural errors
    #[error("no backend attached for fsid {0}")]
    NotAttached(FsId),

    #[error("filesystem {0} is being resynced")]
    Syncing(FsId),

    #[error("record store error: {0}")]
    Storage(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RecordNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// POSIX error code reported to callers of the resync protocols
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::ZeroFileId | Self::IdentityMismatch { .. } | Self::Configuration(_) => {
                libc::EINVAL
            }
            Self::RecordNotFound { .. } => libc::ENOENT,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Timeout => libc::ETIMEDOUT,
            Self::Syncing(_) => libc::EBUSY,
            Self::NotAttached(_) => libc::ENODEV,
            Self::Inconsistent { .. }
            | Self::Transient { .. }
            | Self::Storage(_)
            | Self::Serialization(_)
            | Self::Internal(_) => libc::EIO,
        }
    }
}
