//! Inconsistency classification
//!
//! [`classify`] is a pure function of one record. [`InconsistencyStats`]
//! folds a filesystem's records into per-key counters and file id sets.

use crate::record::Record;
use fmd_common::{FileId, LayoutFlag, UNDEF};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Total number of records
pub const KEY_RECORDS: &str = "mem_n";
/// Records with a disk observation
pub const KEY_DISK_SYNCED: &str = "d_sync_n";
/// Records with a namespace observation
pub const KEY_MGM_SYNCED: &str = "m_sync_n";

/// One way a record can disagree with itself or the namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Inconsistency {
    /// Disk size differs from the reference size (non-erasure)
    DiskSizeDiff,
    /// Erasure stripe is empty on disk while the namespace size is not
    StripeSizeDefect,
    /// Namespace size differs from the reference size (non-erasure)
    MgmSizeDiff,
    DiskChecksumDiff,
    MgmChecksumDiff,
    Orphan,
    Unregistered,
    ReplicaCountWrong,
    MissingReplica,
    BlockChecksumError,
    StripeError,
}

impl Inconsistency {
    pub const ALL: [Self; 11] = [
        Self::DiskSizeDiff,
        Self::StripeSizeDefect,
        Self::MgmSizeDiff,
        Self::DiskChecksumDiff,
        Self::MgmChecksumDiff,
        Self::Orphan,
        Self::Unregistered,
        Self::ReplicaCountWrong,
        Self::MissingReplica,
        Self::BlockChecksumError,
        Self::StripeError,
    ];

    /// Report key
    ///
    /// The erasure stripe defect shares `d_mem_sz_diff` with the plain disk
    /// size mismatch; fleet dashboards read both under that key.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::DiskSizeDiff | Self::StripeSizeDefect => "d_mem_sz_diff",
            Self::MgmSizeDiff => "m_mem_sz_diff",
            Self::DiskChecksumDiff => "d_cx_diff",
            Self::MgmChecksumDiff => "m_cx_diff",
            Self::Orphan => "orphans_n",
            Self::Unregistered => "unreg_n",
            Self::ReplicaCountWrong => "rep_diff_n",
            Self::MissingReplica => "rep_missing_n",
            Self::BlockChecksumError => "blockxs_err",
            Self::StripeError => "stripe_err",
        }
    }
}

const fn defined(size: u64) -> bool {
    size != UNDEF
}

/// Tags describing how a record is inconsistent, empty when it is not
#[must_use]
pub fn classify(record: &Record) -> Vec<Inconsistency> {
    let mut tags = Vec::new();
    let errors = record.layout_errors();

    if record.is_erasure() {
        if defined(record.mgmsize) && record.mgmsize != 0 && record.disksize == 0 {
            tags.push(Inconsistency::StripeSizeDefect);
        }
    } else {
        if defined(record.size) && defined(record.disksize) && record.disksize != record.size {
            tags.push(Inconsistency::DiskSizeDiff);
        }
        if defined(record.size) && defined(record.mgmsize) && record.mgmsize != record.size {
            tags.push(Inconsistency::MgmSizeDiff);
        }
    }

    // Layout errors already explain a checksum difference
    let compare_checksums = errors.is_empty()
        && !record.is_erasure()
        && record.size != 0
        && defined(record.size);
    if compare_checksums {
        if !record.diskchecksum.is_empty() && record.diskchecksum != record.checksum {
            tags.push(Inconsistency::DiskChecksumDiff);
        }
        if !record.mgmchecksum.is_empty() && record.mgmchecksum != record.checksum {
            tags.push(Inconsistency::MgmChecksumDiff);
        }
    }

    for (flag, tag) in [
        (LayoutFlag::Orphan, Inconsistency::Orphan),
        (LayoutFlag::Unregistered, Inconsistency::Unregistered),
        (LayoutFlag::ReplicaWrong, Inconsistency::ReplicaCountWrong),
        (LayoutFlag::Missing, Inconsistency::MissingReplica),
    ] {
        if errors.contains(flag) {
            tags.push(tag);
        }
    }

    if record.block_xs_error() {
        tags.push(Inconsistency::BlockChecksumError);
    }
    if !record.stripeerror.is_empty() {
        tags.push(Inconsistency::StripeError);
    }

    tags
}

/// Counters and file id sets for one filesystem
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InconsistencyStats {
    pub counters: BTreeMap<&'static str, u64>,
    pub fids: BTreeMap<&'static str, BTreeSet<FileId>>,
}

impl InconsistencyStats {
    /// Statistics with every key present and zero
    #[must_use]
    pub fn new() -> Self {
        let mut stats = Self::default();
        for key in [KEY_RECORDS, KEY_DISK_SYNCED, KEY_MGM_SYNCED] {
            stats.counters.insert(key, 0);
        }
        for tag in Inconsistency::ALL {
            stats.counters.insert(tag.key(), 0);
            stats.fids.entry(tag.key()).or_default();
        }
        stats
    }

    /// Fold one record into the statistics
    pub fn collect(&mut self, record: &Record) {
        self.bump(KEY_RECORDS);
        if defined(record.disksize) {
            self.bump(KEY_DISK_SYNCED);
        }
        if defined(record.mgmsize) {
            self.bump(KEY_MGM_SYNCED);
        }
        for tag in classify(record) {
            self.bump(tag.key());
            self.fids.entry(tag.key()).or_default().insert(record.fid);
        }
    }

    fn bump(&mut self, key: &'static str) {
        *self.counters.entry(key).or_default() += 1;
    }

    #[must_use]
    pub fn count(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn fids(&self, key: &str) -> Option<&BTreeSet<FileId>> {
        self.fids.get(key)
    }
}

impl<'a> FromIterator<&'a Record> for InconsistencyStats {
    fn from_iter<I: IntoIterator<Item = &'a Record>>(iter: I) -> Self {
        let mut stats = Self::new();
        for record in iter {
            stats.collect(record);
        }
        stats
    }
}
