//! fmd-store - Replica metadata consistency engine
//!
//! Keeps one metadata record per hosted replica and reconciles it against
//! the physical file and the namespace:
//!
//! - [`backend`]: record stores (one redb database per filesystem, or an
//!   extended attribute on every replica)
//! - [`handler`]: get/create/commit/delete and bulk maintenance on top of a
//!   backend, guarded by per-filesystem locks
//! - [`resync`]: disk, namespace RPC and namespace database resync
//! - [`stats`]: inconsistency classification and fleet statistics
//! - [`converter`]: online migration between backends

pub mod backend;
pub mod converter;
pub mod env;
pub mod error;
pub mod handler;
pub mod io;
pub mod locks;
pub mod namespace;
pub mod record;
pub mod resync;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{AttachOptions, AttrBackend, KvBackend, MetadataBackend, Visit};
pub use converter::{ConversionTask, Converter};
pub use error::{BackendError, BackendResult};
pub use handler::{DiskInfo, FmdHandler, GetOptions, MgmInfo};
pub use io::{FileIo, FileStat, LocalFileIo};
pub use namespace::{MgmClient, MgmTransport, NamespaceDb, NamespaceError, NsFileMd};
pub use record::Record;
pub use resync::ResyncError;
pub use stats::{Inconsistency, InconsistencyStats};
