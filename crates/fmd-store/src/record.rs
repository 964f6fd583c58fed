//! Replica metadata record
//!
//! The record is persisted as a protobuf message so that both backends store
//! bit-identical payloads. Field numbers are part of the on-disk format and
//! must never be reused.

use fmd_common::{
    Error, FileId, FsId, LayoutErrors, LayoutFlag, LayoutId, Result, UNDEF, fid_to_hex,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Replica metadata record, one per (file id, filesystem id)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, prost::Message)]
pub struct Record {
    #[prost(fixed64, tag = "1")]
    pub fid: u64,
    #[prost(fixed64, tag = "2")]
    pub cid: u64,
    #[prost(fixed32, tag = "3")]
    pub fsid: u32,
    #[prost(fixed64, tag = "4")]
    pub ctime: u64,
    #[prost(fixed32, tag = "5")]
    pub ctime_ns: u32,
    #[prost(fixed64, tag = "6")]
    pub mtime: u64,
    #[prost(fixed32, tag = "7")]
    pub mtime_ns: u32,
    #[prost(fixed64, tag = "8")]
    pub atime: u64,
    #[prost(fixed32, tag = "9")]
    pub atime_ns: u32,
    /// Last disk scrub, seconds
    #[prost(fixed64, tag = "10")]
    pub checktime: u64,
    /// Reference size
    #[prost(fixed64, tag = "11")]
    pub size: u64,
    /// Size observed on the physical replica
    #[prost(fixed64, tag = "12")]
    pub disksize: u64,
    /// Size observed at the namespace
    #[prost(fixed64, tag = "13")]
    pub mgmsize: u64,
    #[prost(string, tag = "14")]
    pub checksum: String,
    #[prost(string, tag = "15")]
    pub diskchecksum: String,
    #[prost(string, tag = "16")]
    pub mgmchecksum: String,
    #[prost(fixed32, tag = "17")]
    pub lid: u32,
    #[prost(fixed32, tag = "18")]
    pub uid: u32,
    #[prost(fixed32, tag = "19")]
    pub gid: u32,
    #[prost(sint32, tag = "20")]
    pub filecxerror: i32,
    #[prost(sint32, tag = "21")]
    pub blockcxerror: i32,
    #[prost(sint32, tag = "22")]
    pub layouterror: i32,
    /// Comma separated fsids holding replicas, `!` marks unlinked entries
    #[prost(string, tag = "23")]
    pub locations: String,
    /// Filesystems holding a broken stripe (erasure layouts only)
    #[prost(fixed32, repeated, tag = "24")]
    pub stripeerror: Vec<u32>,
}

impl Record {
    /// Fresh record for a replica with every observation undefined
    #[must_use]
    pub fn new(fid: FileId, fsid: FsId) -> Self {
        let mut record = Self::default();
        record.reset();
        record.fid = fid;
        record.fsid = fsid;
        record
    }

    /// Reset every field, leaving the three sizes undefined
    pub fn reset(&mut self) {
        *self = Self {
            size: UNDEF,
            disksize: UNDEF,
            mgmsize: UNDEF,
            ..Self::default()
        };
    }

    /// Clear the disk axis
    pub fn reset_disk(&mut self) {
        self.disksize = UNDEF;
        self.diskchecksum.clear();
        self.checktime = 0;
        self.filecxerror = 0;
        self.blockcxerror = 0;
        self.stripeerror.clear();
    }

    /// Clear the namespace axis
    pub fn reset_mgm(&mut self) {
        self.mgmsize = UNDEF;
        self.mgmchecksum.clear();
        self.locations.clear();
    }

    #[must_use]
    pub const fn layout_id(&self) -> LayoutId {
        LayoutId::new(self.lid)
    }

    #[must_use]
    pub const fn is_erasure(&self) -> bool {
        self.layout_id().is_erasure()
    }

    #[must_use]
    pub fn layout_errors(&self) -> LayoutErrors {
        u32::try_from(self.layouterror).map_or(LayoutErrors::NONE, LayoutErrors::from_bits)
    }

    pub fn set_layout_errors(&mut self, errors: LayoutErrors) {
        self.layouterror = i32::try_from(errors.bits()).unwrap_or_default();
    }

    /// Merge a single flag into the stored layout errors
    pub fn add_layout_flag(&mut self, flag: LayoutFlag) {
        self.set_layout_errors(self.layout_errors().with(flag));
    }

    /// Linked replica locations, unlinked (`!`) and malformed entries skipped
    #[must_use]
    pub fn locations_set(&self) -> BTreeSet<FsId> {
        self.locations
            .split(',')
            .map(str::trim)
            .filter(|loc| !loc.is_empty() && !loc.starts_with('!'))
            .filter_map(|loc| loc.parse().ok())
            .collect()
    }

    /// Layout errors implied by the namespace view held in this record
    #[must_use]
    pub fn layout_error(&self, fsid: FsId) -> LayoutErrors {
        LayoutErrors::derive(self.layout_id(), &self.locations_set(), fsid)
    }

    #[must_use]
    pub const fn file_xs_error(&self) -> bool {
        self.filecxerror != 0
    }

    #[must_use]
    pub const fn block_xs_error(&self) -> bool {
        self.blockcxerror != 0
    }

    /// Reject a stored record that does not belong to the requested replica
    pub fn check_identity(&self, fid: FileId, fsid: FsId) -> Result<()> {
        if self.fid == fid && self.fsid == fsid {
            Ok(())
        } else {
            Err(Error::IdentityMismatch {
                fid,
                fsid,
                stored_fid: self.fid,
                stored_fsid: self.fsid,
            })
        }
    }

    /// Reject a record whose observations disagree
    ///
    /// Erasure layouts are only rejected on a flagged block checksum error.
    pub fn check_consistency(&self) -> Result<()> {
        let reason = if self.is_erasure() {
            (self.blockcxerror == 1).then(|| "block checksum error".to_string())
        } else if self.size != self.disksize && defined_nonzero(self.disksize) {
            Some(format!(
                "size {} differs from disk size {}",
                self.size, self.disksize
            ))
        } else if self.size != self.mgmsize && defined_nonzero(self.mgmsize) {
            Some(format!(
                "size {} differs from namespace size {}",
                self.size, self.mgmsize
            ))
        } else if self.filecxerror == 1 {
            Some("file checksum error".to_string())
        } else if !self.mgmchecksum.is_empty() && self.mgmchecksum != self.checksum {
            Some(format!(
                "checksum {} differs from namespace checksum {}",
                self.checksum, self.mgmchecksum
            ))
        } else {
            None
        };

        reason.map_or(Ok(()), |reason| {
            Err(Error::Inconsistent {
                fid: self.fid,
                fsid: self.fsid,
                reason,
            })
        })
    }

    /// Render the record as an environment string
    #[must_use]
    pub fn to_env(&self) -> String {
        let mut out = String::with_capacity(512);
        let _ = write!(
            out,
            "id={}&cid={}&fsid={}&ctime={}&ctime_ns={}&mtime={}&mtime_ns={}&atime={}&atime_ns={}\
             &checktime={}&size={}&disksize={}&mgmsize={}&lid={:#x}&uid={}&gid={}\
             &filecxerror={:#x}&blockcxerror={:#x}&layouterror={:#x}",
            self.fid,
            self.cid,
            self.fsid,
            self.ctime,
            self.ctime_ns,
            self.mtime,
            self.mtime_ns,
            self.atime,
            self.atime_ns,
            self.checktime,
            self.size,
            self.disksize,
            self.mgmsize,
            self.lid,
            self.uid,
            self.gid,
            self.filecxerror,
            self.blockcxerror,
            self.layouterror,
        );
        for (key, value) in [
            ("checksum", &self.checksum),
            ("diskchecksum", &self.diskchecksum),
            ("mgmchecksum", &self.mgmchecksum),
            ("locations", &self.locations),
        ] {
            let _ = write!(out, "&{key}={}", or_none(value));
        }
        let stripes: Vec<String> = self.stripeerror.iter().map(u32::to_string).collect();
        let _ = write!(out, "&stripeerror={}&", or_none(&stripes.join(",")));
        out
    }

    /// Short identifier used in log lines
    #[must_use]
    pub fn label(&self) -> String {
        format!("fxid={} fsid={}", fid_to_hex(self.fid), self.fsid)
    }
}

const fn defined_nonzero(size: u64) -> bool {
    size != 0 && size != UNDEF
}

fn or_none(value: &str) -> &str {
    if value.is_empty() { "none" } else { value }
}

/// Current wall clock as (seconds, nanoseconds)
pub(crate) fn now() -> (u64, u32) {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or((0, 0), |d| (d.as_secs(), d.subsec_nanos()))
}
