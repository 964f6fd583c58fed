//! Resync protocols
//!
//! Each protocol reconciles records against one source of truth:
//!
//! - [`disk`]: extended attributes and size of the physical replica
//! - [`mgm`]: the metadata server, one file at a time or through a dump
//! - [`qdb`]: the namespace database, one file at a time or pipelined
//!
//! Per-file protocols return a [`ResyncError`] whose `errno()` is what the
//! storage daemon reports to its callers.

pub mod disk;
pub mod mgm;
pub mod qdb;

use crate::namespace::NamespaceError;
use fmd_common::{FileId, FsId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error("no file id encoded in {0}")]
    InvalidFid(PathBuf),

    #[error("{0} is not a regular file on disk")]
    NotOnDisk(PathBuf),

    #[error("file {0:08x} is orphaned")]
    Orphaned(FileId),

    #[error("no namespace client available")]
    NoClient,

    #[error("failed to update record fid={fid:08x} fsid={fsid}")]
    UpdateFailed { fid: FileId, fsid: FsId },

    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

impl ResyncError {
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidFid(_) | Self::NoClient | Self::UpdateFailed { .. } => libc::EINVAL,
            Self::NotOnDisk(_) | Self::Orphaned(_) => libc::ENOENT,
            Self::Namespace(e) => e.errno(),
        }
    }
}
