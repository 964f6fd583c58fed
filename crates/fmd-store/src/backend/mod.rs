//! Metadata backends
//!
//! A backend persists records for a set of attached filesystems. The KV
//! backend keeps one redb database per filesystem keyed by file id, the
//! attribute backend embeds each record in the replica file itself.

mod attr;
mod kv;

pub use attr::{AttrBackend, HashedPathResolver, PathResolver};
pub use kv::KvBackend;

use crate::error::BackendResult;
use crate::record::Record;
use fmd_common::config::BackendKind;
use fmd_common::{FileId, FsId};
use std::path::Path;

/// Visitor verdict for [`MetadataBackend::for_each`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Leave the stored record untouched
    Keep,
    /// Persist the record as modified by the visitor
    Rewrite,
}

/// Options applied when attaching a filesystem
#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    /// Page cache size in bytes, engine default when `None`
    pub cache_size: Option<usize>,
}

impl AttachOptions {
    /// Options from the configured cache size in MiB, 0 meaning default
    #[must_use]
    pub const fn with_cache_mb(cache_size_mb: usize) -> Self {
        Self {
            cache_size: if cache_size_mb == 0 {
                None
            } else {
                Some(cache_size_mb * 1024 * 1024)
            },
        }
    }
}

/// Storage contract shared by both record stores
///
/// Every per-record operation is scoped to one attached filesystem. Callers
/// serialize mutations per filesystem; backends only need to be safe for
/// concurrent use across filesystems.
pub trait MetadataBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Make a filesystem available, re-attaching replaces the old binding
    fn attach_filesystem(
        &self,
        fsid: FsId,
        path: &Path,
        options: &AttachOptions,
    ) -> BackendResult<()>;

    /// Returns false when the filesystem was not attached
    fn detach_filesystem(&self, fsid: FsId) -> bool;

    fn is_attached(&self, fsid: FsId) -> bool;

    /// Attached filesystem ids in ascending order
    fn filesystems(&self) -> Vec<FsId>;

    fn retrieve(&self, fsid: FsId, fid: FileId) -> BackendResult<Option<Record>>;

    fn put(&self, fsid: FsId, fid: FileId, record: &Record) -> BackendResult<()>;

    /// Removing an absent record succeeds
    fn remove(&self, fsid: FsId, fid: FileId) -> BackendResult<()>;

    /// Visit every record of a filesystem, persisting those marked for rewrite
    fn for_each(
        &self,
        fsid: FsId,
        visit: &mut dyn FnMut(&mut Record) -> Visit,
    ) -> BackendResult<()>;

    fn count(&self, fsid: FsId) -> BackendResult<u64>;

    /// Drop every record of a filesystem
    fn clear(&self, fsid: FsId) -> BackendResult<()>;

    /// Reclaim space, a no-op for stores without compaction
    fn compact(&self, fsid: FsId) -> BackendResult<()>;
}
