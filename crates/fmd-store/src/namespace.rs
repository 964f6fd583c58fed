//! Namespace collaborators
//!
//! Two ways to learn the namespace's view of a replica:
//!
//! - [`MgmClient`] talks to the metadata server through an injected
//!   [`MgmTransport`] (single-file `getfmd` queries and bulk dumps)
//! - [`NamespaceDb`] reads file objects straight from the namespace
//!   database and the per-filesystem file id index

use crate::env::Env;
use crate::record::Record;
use fmd_common::config::MgmConfig;
use fmd_common::{FileId, FsId, LayoutId};
use futures::future::BoxFuture;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Response prefix of a successful `getfmd` query
const GETFMD_OK: &str = "getfmd: retc=0 ";

/// Keys a namespace environment string must carry
const REQUIRED_KEYS: [&str; 11] = [
    "id", "cid", "ctime", "ctime_ns", "mtime", "mtime_ns", "size", "checksum", "lid", "uid",
    "gid",
];

/// Status codes in this range denote a transient transport failure
const TRANSIENT_CODES: std::ops::RangeInclusive<u16> = 100..=300;

/// Failure reported by an MGM transport
#[derive(Debug, Clone, Error)]
#[error("transport status {code}: {message}")]
pub struct TransportError {
    pub code: u16,
    pub message: String,
}

impl TransportError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        TRANSIENT_CODES.contains(&self.code)
    }
}

/// Request/response channel to the metadata server
pub trait MgmTransport: Send + Sync {
    /// Send a query, `None` when the server returned no body
    fn query(
        &self,
        manager: &str,
        request: &str,
        timeout: Duration,
    ) -> Result<Option<String>, TransportError>;

    /// Run a dump request writing its output into `output`
    fn dump(&self, manager: &str, request: &str, output: &Path) -> Result<(), TransportError>;
}

/// Error type for namespace lookups
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("file {0:08x} not found in namespace")]
    NotFound(FileId),

    #[error("namespace request failed with status {code}: {message}")]
    Request { code: u16, message: String },

    #[error("malformed namespace response: {0}")]
    Malformed(String),

    #[error("namespace returned fid {got:08x} for requested {expected:08x}")]
    Mismatch { expected: FileId, got: FileId },

    #[error("namespace database error {errno}: {message}")]
    Db { errno: i32, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NamespaceError {
    /// True only for a definitive absence, never for a failed lookup
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { code, .. } => TRANSIENT_CODES.contains(code),
            Self::Db { errno, .. } => matches!(*errno, libc::EAGAIN | libc::ETIMEDOUT),
            _ => false,
        }
    }

    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENODATA,
            Self::Db { errno, .. } => *errno,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Request { .. } | Self::Malformed(_) | Self::Mismatch { .. } => libc::EIO,
        }
    }
}

impl From<TransportError> for NamespaceError {
    fn from(e: TransportError) -> Self {
        Self::Request {
            code: e.code,
            message: e.message,
        }
    }
}

/// Client for the metadata server's record queries
pub struct MgmClient<T> {
    transport: T,
    config: MgmConfig,
}

impl<T: MgmTransport> MgmClient<T> {
    pub const fn new(transport: T, config: MgmConfig) -> Self {
        Self { transport, config }
    }

    #[must_use]
    pub const fn config(&self) -> &MgmConfig {
        &self.config
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Manager to contact, the configured one unless overridden
    fn manager<'a>(&'a self, manager: Option<&'a str>) -> &'a str {
        manager
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.manager)
    }

    /// Query with bounded retries on transient status codes
    fn query(&self, manager: &str, request: &str) -> Result<Option<String>, TransportError> {
        let mut attempt = 0;
        loop {
            match self
                .transport
                .query(manager, request, self.config.request_timeout())
            {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Transient error from {} (attempt {}/{}): {}",
                        manager, attempt, self.config.max_retries, e
                    );
                    thread::sleep(self.config.retry_backoff());
                }
                result => return result,
            }
        }
    }

    /// Namespace view of one file as a record with the mgm axis populated
    pub fn get_fmd(&self, manager: Option<&str>, fid: FileId) -> Result<Record, NamespaceError> {
        if fid == 0 {
            return Err(NamespaceError::NotFound(fid));
        }
        let manager = self.manager(manager);
        let request = format!("/?mgm.pcmd=getfmd&mgm.getfmd.fid={fid:08x}");
        let response = self.query(manager, &request)?.unwrap_or_default();

        let Some(payload) = response.strip_prefix(GETFMD_OK) else {
            debug!("No record for fid={:08x} at {}: {:?}", fid, manager, response);
            return Err(NamespaceError::NotFound(fid));
        };

        let record = record_from_mgm_env(&Env::parse(payload))
            .ok_or_else(|| NamespaceError::Malformed(payload.to_string()))?;
        if record.fid != fid {
            return Err(NamespaceError::Mismatch {
                expected: fid,
                got: record.fid,
            });
        }
        Ok(record)
    }

    /// Bulk dump of every replica registered on `fsid`
    ///
    /// The temporary file is removed when the returned handle is dropped.
    pub fn fetch_dump(
        &self,
        manager: Option<&str>,
        fsid: FsId,
    ) -> Result<NamedTempFile, NamespaceError> {
        let manager = self.manager(manager);
        let output = tempfile::Builder::new().prefix("efstd.").tempfile()?;
        let request = format!(
            "/proc/admin/?&mgm.format=fuse&mgm.cmd=fs&mgm.subcmd=dumpmd\
             &mgm.dumpmd.option=m&mgm.fsid={fsid}"
        );
        self.transport.dump(manager, &request, output.path())?;
        Ok(output)
    }
}

/// Record from a namespace environment string
///
/// The namespace fields land on the mgm axis; the reference size and
/// checksum stay undefined. Returns `None` when a required key is missing
/// or not numeric.
#[must_use]
pub fn record_from_mgm_env(env: &Env) -> Option<Record> {
    if REQUIRED_KEYS.iter().any(|key| !env.contains(key)) {
        return None;
    }

    let fid = env.get_num("id", 10)?;
    let mut record = Record::new(fid, 0);
    record.cid = env.get_num("cid", 10)?;
    record.ctime = env.get_num("ctime", 10)?;
    record.ctime_ns = u32::try_from(env.get_num("ctime_ns", 10)?).ok()?;
    record.mtime = env.get_num("mtime", 10)?;
    record.mtime_ns = u32::try_from(env.get_num("mtime_ns", 10)?).ok()?;
    record.mgmsize = env.get_num("size", 10)?;
    record.lid = u32::try_from(env.get_num("lid", 10)?).ok()?;
    record.uid = u32::try_from(env.get_num("uid", 10)?).ok()?;
    record.gid = u32::try_from(env.get_num("gid", 10)?).ok()?;
    record.mgmchecksum = record
        .layout_id()
        .truncate_checksum(env.get("checksum").unwrap_or_default());
    record.locations = env
        .get("location")
        .unwrap_or_default()
        .split(',')
        .filter(|loc| !loc.is_empty() && !loc.starts_with('!'))
        .collect::<Vec<_>>()
        .join(",");
    Some(record)
}

/// File object as stored in the namespace database
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NsFileMd {
    pub id: FileId,
    pub cont_id: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u32,
    pub mtime_sec: u64,
    pub mtime_nsec: u32,
    pub size: u64,
    pub layout_id: u32,
    pub uid: u32,
    pub gid: u32,
    /// Binary digest
    pub checksum: Vec<u8>,
    /// Linked locations
    pub locations: Vec<FsId>,
}

impl NsFileMd {
    /// Record for the replica on `fsid` with the mgm axis populated
    #[must_use]
    pub fn to_record(&self, fsid: FsId) -> Record {
        let lid = LayoutId::new(self.layout_id);
        let mut record = Record::new(self.id, fsid);
        record.cid = self.cont_id;
        record.ctime = self.ctime_sec;
        record.ctime_ns = self.ctime_nsec;
        record.mtime = self.mtime_sec;
        record.mtime_ns = self.mtime_nsec;
        record.mgmsize = self.size;
        record.lid = self.layout_id;
        record.uid = self.uid;
        record.gid = self.gid;
        record.mgmchecksum = lid.truncate_checksum(&hex::encode(&self.checksum));
        record.locations = self
            .locations
            .iter()
            .map(FsId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        record
    }
}

/// Namespace database client
pub trait NamespaceDb: Send + Sync {
    /// File ids registered against a filesystem in the distributed index
    fn filesystem_file_ids(&self, fsid: FsId) -> Result<Vec<FileId>, NamespaceError>;

    /// Fetch one file object, [`NamespaceError::NotFound`] when absent
    fn fetch_file(&self, fid: FileId) -> BoxFuture<'static, Result<NsFileMd, NamespaceError>>;
}
