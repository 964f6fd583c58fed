//! Filesystem metadata handler
//!
//! The handler owns a backend, the per-filesystem lock table and the sync
//! status flags. Every public operation takes the filesystem-set lock shared
//! and then the per-filesystem lock; only attach/detach and database trimming
//! take the filesystem-set lock exclusively. Public operations never call
//! each other while holding a lock.
//!
//! Records handed out are copies. Updates build the new record locally and
//! persist it with a single backend `put`.

use crate::backend::{AttachOptions, MetadataBackend, Visit};
use crate::io::{ATTR_FILE_XS_ERROR, ATTR_ORPHANED, FileIo, is_missing};
use crate::locks::FsLockTable;
use crate::record::{Record, now};
use crate::stats::InconsistencyStats;
use dashmap::DashMap;
use fmd_common::config::{FmdConfig, QdbConfig, ScanConfig};
use fmd_common::{
    Error, FileId, FsId, LayoutErrors, LayoutFlag, UNDEF, fid_from_path, fid_prefix_to_full_path,
};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Quarantine directory for replicas unknown to the namespace
pub const ORPHANS_DIR: &str = ".eosorphans";

/// Ownership and layout stamped on a record created by [`FmdHandler::get`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub lid: u32,
}

/// How [`FmdHandler::get`] treats absent and inconsistent records
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    /// Return the record even when inconsistent or mismatched
    pub force_retrieve: bool,
    /// Create the record when absent
    pub create: Option<Ownership>,
}

impl GetOptions {
    #[must_use]
    pub const fn forced() -> Self {
        Self {
            force_retrieve: true,
            create: None,
        }
    }

    #[must_use]
    pub const fn create(uid: u32, gid: u32, lid: u32) -> Self {
        Self {
            force_retrieve: false,
            create: Some(Ownership { uid, gid, lid }),
        }
    }

    #[must_use]
    pub const fn force(mut self) -> Self {
        self.force_retrieve = true;
        self
    }
}

/// Observation of the physical replica
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskInfo {
    pub size: u64,
    /// Hex digest, empty when unknown
    pub checksum: String,
    /// Scrub time, seconds
    pub check_time: u64,
    pub file_xs_error: bool,
    pub block_xs_error: bool,
    /// Mark the record orphaned, used when the namespace is unreachable
    pub flag_layout_error: bool,
}

/// Observation of the namespace
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MgmInfo {
    pub cid: u64,
    pub lid: u32,
    pub size: u64,
    /// Hex digest, truncated to the layout's checksum length on update
    pub checksum: String,
    pub uid: u32,
    pub gid: u32,
    pub ctime: u64,
    pub ctime_ns: u32,
    pub mtime: u64,
    pub mtime_ns: u32,
    pub layout_error: LayoutErrors,
    pub locations: String,
}

impl MgmInfo {
    /// Namespace fields of a record produced by a namespace lookup
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        Self {
            cid: record.cid,
            lid: record.lid,
            size: record.mgmsize,
            checksum: record.mgmchecksum.clone(),
            uid: record.uid,
            gid: record.gid,
            ctime: record.ctime,
            ctime_ns: record.ctime_ns,
            mtime: record.mtime,
            mtime_ns: record.mtime_ns,
            layout_error: record.layout_errors(),
            locations: record.locations.clone(),
        }
    }
}

/// Replica metadata handler bound to one backend
pub struct FmdHandler<B> {
    pub(crate) backend: B,
    pub(crate) io: Arc<dyn FileIo>,
    fs_set: RwLock<()>,
    locks: FsLockTable,
    syncing: DashMap<FsId, bool>,
    pub(crate) scan: ScanConfig,
    pub(crate) qdb: QdbConfig,
}

impl<B: MetadataBackend> FmdHandler<B> {
    pub fn new(backend: B, io: Arc<dyn FileIo>) -> Self {
        Self::with_config(backend, io, &FmdConfig::default())
    }

    pub fn with_config(backend: B, io: Arc<dyn FileIo>, config: &FmdConfig) -> Self {
        Self {
            backend,
            io,
            fs_set: RwLock::new(()),
            locks: FsLockTable::new(),
            syncing: DashMap::new(),
            scan: config.scan.clone(),
            qdb: config.qdb.clone(),
        }
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn io(&self) -> &dyn FileIo {
        self.io.as_ref()
    }

    // ---- Filesystem set ----

    /// Bind a filesystem to the backend
    ///
    /// `path` is the metadata directory for the KV backend and the
    /// filesystem root for the attribute backend.
    pub fn attach_filesystem(&self, fsid: FsId, path: &Path, options: &AttachOptions) -> bool {
        let _set = self.fs_set.write();
        self.locks.write(fsid, || {
            match self.backend.attach_filesystem(fsid, path, options) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to attach fsid={} at {}: {}", fsid, path.display(), e);
                    false
                }
            }
        })
    }

    pub fn detach_filesystem(&self, fsid: FsId) -> bool {
        let _set = self.fs_set.write();
        self.locks
            .write(fsid, || self.backend.detach_filesystem(fsid))
    }

    #[must_use]
    pub fn num_filesystems(&self) -> usize {
        let _set = self.fs_set.read();
        self.backend.filesystems().len()
    }

    fn attached(&self, fsid: FsId) -> bool {
        if self.backend.is_attached(fsid) {
            true
        } else {
            error!(critical = true, "No backend attached for fsid={}", fsid);
            false
        }
    }

    // ---- Record access ----

    /// Get a copy of the record of `(fid, fsid)`
    ///
    /// Inconsistent records are rejected unless forced or creating, so that
    /// callers never serve data described by a disagreeing record.
    pub fn get(&self, fid: FileId, fsid: FsId, options: &GetOptions) -> Option<Record> {
        if fid == 0 {
            warn!("Refusing record lookup for fid 0 on fsid={}", fsid);
            return None;
        }

        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return None;
        }

        let lookup = || self.get_unlocked(fid, fsid, options);
        if options.create.is_some() {
            self.locks.write(fsid, lookup)
        } else {
            self.locks.read(fsid, lookup)
        }
    }

    fn get_unlocked(&self, fid: FileId, fsid: FsId, options: &GetOptions) -> Option<Record> {
        let stored = match self.backend.retrieve(fsid, fid) {
            Ok(stored) => stored,
            Err(e) => {
                error!("Failed to retrieve fid={:08x} fsid={}: {}", fid, fsid, e);
                return None;
            }
        };

        if let Some(record) = stored {
            if let Err(e) = record.check_identity(fid, fsid) {
                error!(critical = true, "{}", e);
                if !options.force_retrieve {
                    return None;
                }
            }
            if !options.force_retrieve && options.create.is_none() {
                if let Err(e) = record.check_consistency() {
                    error!(critical = true, "Rejecting record: {}", e);
                    return None;
                }
            }
            return Some(record);
        }

        let owner = options.create?;
        let mut record = Record::new(fid, fsid);
        record.uid = owner.uid;
        record.gid = owner.gid;
        record.lid = owner.lid;
        let (sec, nsec) = now();
        record.ctime = sec;
        record.ctime_ns = nsec;
        if self.store_unlocked(&mut record, true) {
            debug!("Created record {}", record.label());
            Some(record)
        } else {
            None
        }
    }

    /// Raw record, no identity or consistency checks
    pub fn retrieve(&self, fid: FileId, fsid: FsId) -> Option<Record> {
        let _set = self.fs_set.read();
        self.locks
            .read(fsid, || match self.backend.retrieve(fsid, fid) {
                Ok(record) => record,
                Err(e) => {
                    error!("Failed to retrieve fid={:08x} fsid={}: {}", fid, fsid, e);
                    None
                }
            })
    }

    /// Stamp modification and access time, then persist
    pub fn commit(&self, record: &mut Record) -> bool {
        if record.fid == 0 {
            error!("Refusing to commit a record with fid 0");
            return false;
        }
        let _set = self.fs_set.read();
        let fsid = record.fsid;
        if !self.attached(fsid) {
            return false;
        }
        self.locks.write(fsid, || self.store_unlocked(record, true))
    }

    /// Persist a record exactly as given
    pub fn restore(&self, record: &Record) -> bool {
        if record.fid == 0 {
            error!("Refusing to restore a record with fid 0");
            return false;
        }
        let _set = self.fs_set.read();
        let fsid = record.fsid;
        if !self.attached(fsid) {
            return false;
        }
        let mut record = record.clone();
        self.locks
            .write(fsid, || self.store_unlocked(&mut record, false))
    }

    fn store_unlocked(&self, record: &mut Record, stamp: bool) -> bool {
        if stamp {
            let (sec, nsec) = now();
            record.mtime = sec;
            record.mtime_ns = nsec;
            record.atime = sec;
            record.atime_ns = nsec;
        }
        match self.backend.put(record.fsid, record.fid, record) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to commit {}: {}", record.label(), e);
                false
            }
        }
    }

    pub fn delete(&self, fid: FileId, fsid: FsId) -> bool {
        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return false;
        }
        self.locks
            .write(fsid, || match self.backend.remove(fsid, fid) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to delete fid={:08x} fsid={}: {}", fid, fsid, e);
                    false
                }
            })
    }

    // ---- Updates ----

    /// Retrieve-or-default, apply `update`, persist; all under the write lock
    fn update_unlocked(
        &self,
        fid: FileId,
        fsid: FsId,
        stamp: bool,
        update: impl FnOnce(&mut Record),
    ) -> bool {
        let mut record = match self.backend.retrieve(fsid, fid) {
            Ok(Some(record)) => record,
            Ok(None) => Record::new(fid, fsid),
            Err(e) => {
                error!("Failed to retrieve fid={:08x} fsid={}: {}", fid, fsid, e);
                return false;
            }
        };
        record.fid = fid;
        record.fsid = fsid;
        update(&mut record);
        self.store_unlocked(&mut record, stamp)
    }

    fn update(
        &self,
        fid: FileId,
        fsid: FsId,
        stamp: bool,
        update: impl FnOnce(&mut Record),
    ) -> bool {
        if fid == 0 {
            warn!("Skipping update for fid 0 on fsid={}", fsid);
            return false;
        }
        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return false;
        }
        self.locks
            .write(fsid, || self.update_unlocked(fid, fsid, stamp, update))
    }

    /// Overwrite the disk axis with a scrub observation
    pub fn update_with_disk_info(&self, fsid: FsId, fid: FileId, info: &DiskInfo) -> bool {
        self.update(fid, fsid, true, |record| {
            let lid = record.layout_id();
            record.disksize = info.size;
            record.diskchecksum = if info.checksum.is_empty() && info.size == 0 {
                lid.empty_file_checksum().unwrap_or_default().to_string()
            } else {
                info.checksum.clone()
            };
            record.checktime = info.check_time;
            record.filecxerror = i32::from(info.file_xs_error);
            record.blockcxerror = i32::from(info.block_xs_error);

            if !lid.is_erasure() {
                if record.size == UNDEF {
                    record.size = info.size;
                }
                if record.checksum.is_empty() {
                    record.checksum.clone_from(&record.diskchecksum);
                }
            }

            if info.flag_layout_error {
                record.add_layout_flag(LayoutFlag::Orphan);
            }
        })
    }

    /// Overwrite the namespace axis
    ///
    /// Erasure layouts always take their logical size from the namespace.
    /// Namespace timestamps are kept as reported.
    pub fn update_with_mgm_info(&self, fsid: FsId, fid: FileId, info: &MgmInfo) -> bool {
        self.update(fid, fsid, false, |record| {
            record.cid = info.cid;
            record.lid = info.lid;
            record.uid = info.uid;
            record.gid = info.gid;
            record.ctime = info.ctime;
            record.ctime_ns = info.ctime_ns;
            record.mtime = info.mtime;
            record.mtime_ns = info.mtime_ns;
            record.mgmsize = info.size;
            record.mgmchecksum = record.layout_id().truncate_checksum(&info.checksum);
            record.locations.clone_from(&info.locations);
            record.set_layout_errors(info.layout_error);

            if record.size == UNDEF || record.is_erasure() {
                record.size = info.size;
            }
            if record.checksum.is_empty() {
                record.checksum.clone_from(&record.mgmchecksum);
            }
        })
    }

    /// Bulk rewrite of every record of a filesystem
    fn rewrite_all(&self, fsid: FsId, what: &str, reset: fn(&mut Record)) -> bool {
        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return false;
        }
        self.locks.write(fsid, || {
            let result = self.backend.for_each(fsid, &mut |record| {
                reset(record);
                Visit::Rewrite
            });
            match result {
                Ok(()) => {
                    info!("Reset {} information of fsid={}", what, fsid);
                    true
                }
                Err(e) => {
                    error!("Failed to reset {} information of fsid={}: {}", what, fsid, e);
                    false
                }
            }
        })
    }

    /// Forget every disk observation of a filesystem
    pub fn reset_disk_information(&self, fsid: FsId) -> bool {
        self.rewrite_all(fsid, "disk", Record::reset_disk)
    }

    /// Forget every namespace observation of a filesystem
    pub fn reset_mgm_information(&self, fsid: FsId) -> bool {
        self.rewrite_all(fsid, "mgm", Record::reset_mgm)
    }

    // ---- Filesystem-wide maintenance ----

    /// Delete records of orphaned or unregistered replicas gone from disk
    ///
    /// Returns the removed file ids, or `None` when the filesystem is being
    /// resynced or could not be scanned.
    pub fn remove_ghost_entries(&self, fs_root: &Path, fsid: FsId) -> Option<Vec<FileId>> {
        if self.is_syncing(fsid) {
            warn!("Not removing ghost entries of fsid={} while syncing", fsid);
            return None;
        }

        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return None;
        }

        let mut flagged = Vec::new();
        let scan = self.locks.read(fsid, || {
            self.backend.for_each(fsid, &mut |record| {
                let errors = record.layout_errors();
                if !errors.is_empty() {
                    flagged.push((record.fid, errors));
                }
                Visit::Keep
            })
        });
        if let Err(e) = scan {
            error!("Failed to scan fsid={} for ghost entries: {}", fsid, e);
            return None;
        }

        let ghosts: Vec<FileId> = flagged
            .into_iter()
            .filter(|(_, errors)| {
                errors.intersects(&[LayoutFlag::Orphan, LayoutFlag::Unregistered])
            })
            .filter(|(fid, _)| {
                let path = fid_prefix_to_full_path(*fid, fs_root);
                matches!(self.io.stat(&path), Err(ref e) if is_missing(e))
            })
            .map(|(fid, _)| fid)
            .collect();

        self.delete_ghosts(fsid, ghosts)
    }

    /// Remove the given records unless a resync started since the scan
    fn delete_ghosts(&self, fsid: FsId, ghosts: Vec<FileId>) -> Option<Vec<FileId>> {
        self.locks.write(fsid, || {
            if self.is_syncing(fsid) {
                warn!("fsid={} started syncing, keeping ghost entries", fsid);
                return None;
            }
            let removed = ghosts
                .into_iter()
                .filter(|fid| match self.backend.remove(fsid, *fid) {
                    Ok(()) => {
                        info!("Removed ghost entry fid={:08x} fsid={}", fid, fsid);
                        true
                    }
                    Err(e) => {
                        error!("Failed to remove ghost fid={:08x} fsid={}: {}", fid, fsid, e);
                        false
                    }
                })
                .collect();
            Some(removed)
        })
    }

    /// Inconsistency counters and file id sets of a filesystem
    pub fn inconsistency_statistics(&self, fsid: FsId) -> fmd_common::Result<InconsistencyStats> {
        if self.is_syncing(fsid) {
            return Err(Error::Syncing(fsid));
        }
        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return Err(Error::NotAttached(fsid));
        }

        let mut stats = InconsistencyStats::new();
        self.locks.read(fsid, || {
            self.backend.for_each(fsid, &mut |record| {
                stats.collect(record);
                Visit::Keep
            })
        })?;
        Ok(stats)
    }

    /// Records of a filesystem, for reporting
    pub fn records(&self, fsid: FsId) -> fmd_common::Result<Vec<Record>> {
        let _set = self.fs_set.read();
        if !self.backend.is_attached(fsid) {
            return Err(Error::NotAttached(fsid));
        }
        let mut records = Vec::new();
        self.locks.read(fsid, || {
            self.backend.for_each(fsid, &mut |record| {
                records.push(record.clone());
                Visit::Keep
            })
        })?;
        Ok(records)
    }

    #[must_use]
    pub fn is_syncing(&self, fsid: FsId) -> bool {
        self.syncing.get(&fsid).is_some_and(|flag| *flag)
    }

    pub fn set_sync_status(&self, fsid: FsId, syncing: bool) {
        debug!("fsid={} syncing={}", fsid, syncing);
        self.syncing.insert(fsid, syncing);
    }

    /// True when the record or the replica attribute reports a checksum error
    pub fn file_has_xs_error(&self, path: &Path, fsid: FsId) -> bool {
        let fid = fid_from_path(path);
        if fid != 0 && self.retrieve(fid, fsid).is_some_and(|r| r.file_xs_error()) {
            return true;
        }
        matches!(
            self.io.attr_get_string(path, ATTR_FILE_XS_ERROR),
            Ok(Some(value)) if value == "1"
        )
    }

    /// Drop every record of a filesystem
    pub fn reset_db(&self, fsid: FsId) -> bool {
        let _set = self.fs_set.read();
        if !self.attached(fsid) {
            return false;
        }
        self.locks.write(fsid, || match self.backend.clear(fsid) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to reset db of fsid={}: {}", fsid, e);
                false
            }
        })
    }

    /// Compact every attached filesystem's store
    pub fn trim_db(&self) -> bool {
        let _set = self.fs_set.write();
        let mut ok = true;
        for fsid in self.backend.filesystems() {
            if let Err(e) = self.backend.compact(fsid) {
                error!("Failed to trim db of fsid={}: {}", fsid, e);
                ok = false;
            }
        }
        ok
    }

    #[must_use]
    pub fn num_files(&self, fsid: FsId) -> u64 {
        let _set = self.fs_set.read();
        self.locks
            .read(fsid, || self.backend.count(fsid))
            .unwrap_or_else(|e| {
                warn!("Failed to count records of fsid={}: {}", fsid, e);
                0
            })
    }

    /// Copy every record of `fsid` missing at `target`
    ///
    /// Returns the number of records copied.
    pub fn convert_all_to<T: MetadataBackend>(
        &self,
        fsid: FsId,
        target: &FmdHandler<T>,
    ) -> usize {
        let records = match self.records(fsid) {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to list records of fsid={}: {}", fsid, e);
                return 0;
            }
        };

        let mut copied = 0;
        for record in records {
            if target.retrieve(record.fid, fsid).is_some() {
                continue;
            }
            if target.restore(&record) {
                copied += 1;
            }
        }
        info!("Converted {} records of fsid={}", copied, fsid);
        copied
    }

    /// Move a replica into the filesystem's quarantine directory
    ///
    /// `<root>/<hash dir>/<fid hex>` becomes `<root>/.eosorphans/<fid hex>`
    /// with the original path kept in `user.eos.orphaned`.
    pub fn move_to_orphans(&self, path: &Path) -> Option<PathBuf> {
        if path.components().count() <= 2 {
            error!("Refusing to quarantine {}: path too short", path.display());
            return None;
        }
        let name = path.file_name()?;
        let root = path.parent()?.parent()?;
        let orphans = root.join(ORPHANS_DIR);
        let target = orphans.join(name);

        let original = path.to_string_lossy();
        if let Err(e) = self.io.attr_set(path, ATTR_ORPHANED, original.as_bytes()) {
            error!("Failed to tag orphan {}: {}", path.display(), e);
            return None;
        }
        if let Err(e) = self
            .io
            .mkdir_all(&orphans)
            .and_then(|()| self.io.rename(path, &target))
        {
            error!("Failed to quarantine {}: {}", path.display(), e);
            return None;
        }
        warn!("Moved orphan {} to {}", path.display(), target.display());
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttrBackend, KvBackend};
    use crate::io::LocalFileIo;
    use crate::testing::MemoryFileIo;
    use tempfile::{TempDir, tempdir};

    const LID: u32 = 0x2002_0002;
    const RAIN: u32 = 0x2002_0542;

    fn kv_handler() -> (TempDir, FmdHandler<KvBackend>) {
        let dir = tempdir().unwrap();
        let handler = FmdHandler::new(KvBackend::new(), Arc::new(LocalFileIo));
        assert!(handler.attach_filesystem(3, dir.path(), &AttachOptions::default()));
        (dir, handler)
    }

    fn disk(size: u64, checksum: &str) -> DiskInfo {
        DiskInfo {
            size,
            checksum: checksum.to_string(),
            check_time: 1_700_000_000,
            ..DiskInfo::default()
        }
    }

    #[test]
    fn test_create_stamps_now() {
        let (_dir, handler) = kv_handler();
        let (before, _) = now();
        let record = handler.get(42, 3, &GetOptions::create(1, 2, LID)).unwrap();
        assert_eq!(record.fid, 42);
        assert_eq!(record.fsid, 3);
        assert_eq!((record.uid, record.gid, record.lid), (1, 2, LID));
        assert!(record.ctime >= before && record.ctime <= before + 5);
        assert_eq!(record.disksize, UNDEF);
    }

    #[test]
    fn test_get_absent_without_create() {
        let (_dir, handler) = kv_handler();
        assert!(handler.get(42, 3, &GetOptions::default()).is_none());
        assert!(handler.get(0, 3, &GetOptions::create(0, 0, LID)).is_none());
        // Not attached: never created implicitly
        assert!(handler.get(42, 9, &GetOptions::create(0, 0, LID)).is_none());
        assert_eq!(handler.num_files(3), 0);
    }

    #[test]
    fn test_commit_then_forced_retrieve_identical() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(42, 3);
        record.lid = LID;
        record.size = 10;
        record.checksum = "abcd1234".into();
        record.locations = "3,4".into();
        assert!(handler.commit(&mut record));

        let fetched = handler.get(42, 3, &GetOptions::forced()).unwrap();
        assert_eq!(fetched, record);
        assert!(record.mtime > 0);
    }

    #[test]
    fn test_commit_rejects_zero_fid() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(0, 3);
        assert!(!handler.commit(&mut record));
    }

    #[test]
    fn test_inconsistent_rejected_unless_forced() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(42, 3);
        record.lid = LID;
        record.size = 100;
        record.disksize = 50;
        assert!(handler.commit(&mut record));

        assert!(handler.get(42, 3, &GetOptions::default()).is_none());
        assert!(handler.get(42, 3, &GetOptions::forced()).is_some());
        assert!(handler.get(42, 3, &GetOptions::create(0, 0, LID)).is_some());
    }

    #[test]
    fn test_erasure_only_rejected_on_block_error() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(42, 3);
        record.lid = RAIN;
        record.size = 100;
        record.disksize = 50;
        assert!(handler.commit(&mut record));
        assert!(handler.get(42, 3, &GetOptions::default()).is_some());

        record.blockcxerror = 1;
        assert!(handler.commit(&mut record));
        assert!(handler.get(42, 3, &GetOptions::default()).is_none());
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let (_dir, handler) = kv_handler();
        let stray = Record::new(43, 3);
        handler.backend().put(3, 42, &stray).unwrap();

        assert!(handler.get(42, 3, &GetOptions::default()).is_none());
        assert_eq!(handler.get(42, 3, &GetOptions::forced()).unwrap().fid, 43);
    }

    #[test]
    fn test_new_replica_scenario() {
        let (_dir, handler) = kv_handler();
        let record = handler.get(42, 3, &GetOptions::create(0, 0, LID)).unwrap();
        assert_eq!(record.disksize, UNDEF);

        assert!(handler.update_with_disk_info(3, 42, &disk(1024, "abcd1234")));
        let record = handler.retrieve(42, 3).unwrap();
        assert_eq!(record.disksize, 1024);
        assert_eq!(record.checksum, "abcd1234");
        assert_eq!(record.size, 1024);
        assert_eq!(record.checktime, 1_700_000_000);
        assert!(record.layout_errors().is_empty());
    }

    #[test]
    fn test_disk_info_checksum_not_overwritten() {
        let (_dir, handler) = kv_handler();
        handler.get(42, 3, &GetOptions::create(0, 0, LID)).unwrap();
        assert!(handler.update_with_disk_info(3, 42, &disk(1024, "abcd1234")));
        assert!(handler.update_with_disk_info(3, 42, &disk(2048, "ffffffff")));

        let record = handler.retrieve(42, 3).unwrap();
        assert_eq!(record.checksum, "abcd1234");
        assert_eq!(record.size, 1024);
        assert_eq!(record.diskchecksum, "ffffffff");
        assert_eq!(record.disksize, 2048);
    }

    #[test]
    fn test_empty_file_digest() {
        let (_dir, handler) = kv_handler();
        handler.get(42, 3, &GetOptions::create(0, 0, LID)).unwrap();
        assert!(handler.update_with_disk_info(3, 42, &disk(0, "")));
        let record = handler.retrieve(42, 3).unwrap();
        // adler32 of nothing
        assert_eq!(record.diskchecksum, "00000001");
        assert_eq!(record.checksum, "00000001");
    }

    #[test]
    fn test_disk_info_flags_orphan_and_errors() {
        let (_dir, handler) = kv_handler();
        let info = DiskInfo {
            file_xs_error: true,
            flag_layout_error: true,
            ..disk(10, "aa")
        };
        assert!(handler.update_with_disk_info(3, 7, &info));
        let record = handler.retrieve(7, 3).unwrap();
        assert!(record.file_xs_error());
        assert!(record.layout_errors().contains(LayoutFlag::Orphan));
        assert!(handler.file_has_xs_error(Path::new("/nonexistent/00000007"), 3));
    }

    #[test]
    fn test_mgm_info_erasure_size_tracks_namespace() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(42, 3);
        record.lid = RAIN;
        record.size = 100;
        assert!(handler.commit(&mut record));

        let info = MgmInfo {
            lid: RAIN,
            size: 300,
            checksum: "abcd1234ffff".into(),
            locations: "3,4,5,6".into(),
            mtime: 17,
            ..MgmInfo::default()
        };
        assert!(handler.update_with_mgm_info(3, 42, &info));
        let record = handler.retrieve(42, 3).unwrap();
        assert_eq!(record.size, 300);
        assert_eq!(record.mgmsize, 300);
        assert_eq!(record.mgmchecksum, "abcd1234");
        assert_eq!(record.mtime, 17);
    }

    #[test]
    fn test_mgm_info_plain_keeps_size() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(42, 3);
        record.lid = LID;
        record.size = 100;
        record.checksum = "11111111".into();
        assert!(handler.commit(&mut record));

        let info = MgmInfo {
            lid: LID,
            size: 300,
            checksum: "22222222".into(),
            layout_error: LayoutErrors::only(LayoutFlag::Unregistered),
            ..MgmInfo::default()
        };
        assert!(handler.update_with_mgm_info(3, 42, &info));
        let record = handler.retrieve(42, 3).unwrap();
        assert_eq!(record.size, 100);
        assert_eq!(record.checksum, "11111111");
        assert_eq!(record.layout_errors(), LayoutErrors::only(LayoutFlag::Unregistered));
    }

    #[test]
    fn test_reset_disk_information() {
        let (_dir, handler) = kv_handler();
        for fid in 1..=3 {
            let mut record = Record::new(fid, 3);
            record.disksize = 10;
            record.diskchecksum = "aa".into();
            record.checktime = 5;
            record.filecxerror = 1;
            record.blockcxerror = 1;
            record.mgmsize = 10;
            record.mgmchecksum = "bb".into();
            assert!(handler.commit(&mut record));
        }

        assert!(handler.reset_disk_information(3));
        for record in handler.records(3).unwrap() {
            assert_eq!(record.disksize, UNDEF);
            assert!(record.diskchecksum.is_empty());
            assert_eq!(record.checktime, 0);
            assert!(!record.file_xs_error() && !record.block_xs_error());
            assert_eq!(record.mgmsize, 10);
            assert_eq!(record.mgmchecksum, "bb");
        }

        assert!(handler.reset_mgm_information(3));
        assert!(handler.records(3).unwrap().iter().all(|r| r.mgmsize == UNDEF));
    }

    #[test]
    fn test_ghost_sweep() {
        let (dir, handler) = kv_handler();
        let fs_root = dir.path().join("fs");

        let mut ghost = Record::new(1, 3);
        ghost.set_layout_errors(LayoutErrors::only(LayoutFlag::Unregistered));
        assert!(handler.commit(&mut ghost));

        let mut healthy = Record::new(2, 3);
        assert!(handler.commit(&mut healthy));

        let mut present = Record::new(3, 3);
        present.set_layout_errors(LayoutErrors::only(LayoutFlag::Orphan));
        assert!(handler.commit(&mut present));
        let path = fid_prefix_to_full_path(3, &fs_root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let mut missing = Record::new(4, 3);
        missing.set_layout_errors(LayoutErrors::only(LayoutFlag::Missing));
        assert!(handler.commit(&mut missing));

        handler.set_sync_status(3, true);
        assert!(handler.remove_ghost_entries(&fs_root, 3).is_none());
        handler.set_sync_status(3, false);

        assert_eq!(handler.remove_ghost_entries(&fs_root, 3), Some(vec![1]));
        assert!(handler.retrieve(1, 3).is_none());
        assert!(handler.retrieve(2, 3).is_some());
        assert!(handler.retrieve(3, 3).is_some());
        assert!(handler.retrieve(4, 3).is_some());
    }

    #[test]
    fn test_ghost_delete_skipped_once_syncing() {
        let (_dir, handler) = kv_handler();
        let mut ghost = Record::new(1, 3);
        ghost.set_layout_errors(LayoutErrors::only(LayoutFlag::Orphan));
        assert!(handler.commit(&mut ghost));

        handler.set_sync_status(3, true);
        assert!(handler.delete_ghosts(3, vec![1]).is_none());
        assert!(handler.retrieve(1, 3).is_some());

        handler.set_sync_status(3, false);
        assert_eq!(handler.delete_ghosts(3, vec![1]), Some(vec![1]));
        assert!(handler.retrieve(1, 3).is_none());
    }

    #[test]
    fn test_statistics_refused_while_syncing() {
        let (_dir, handler) = kv_handler();
        let mut record = Record::new(1, 3);
        record.lid = LID;
        record.size = 100;
        record.mgmsize = 200;
        assert!(handler.commit(&mut record));

        handler.set_sync_status(3, true);
        assert!(matches!(
            handler.inconsistency_statistics(3),
            Err(Error::Syncing(3))
        ));
        handler.set_sync_status(3, false);

        let stats = handler.inconsistency_statistics(3).unwrap();
        assert_eq!(stats.count("m_mem_sz_diff"), 1);
        assert!(matches!(
            handler.inconsistency_statistics(8),
            Err(Error::NotAttached(8))
        ));
    }

    #[test]
    fn test_reset_db_and_trim() {
        let (_dir, handler) = kv_handler();
        for fid in 1..=4 {
            assert!(handler.commit(&mut Record::new(fid, 3)));
        }
        assert_eq!(handler.num_files(3), 4);
        assert!(handler.delete(4, 3));
        assert_eq!(handler.num_files(3), 3);
        assert!(handler.reset_db(3));
        assert_eq!(handler.num_files(3), 0);
        assert!(handler.trim_db());
        assert_eq!(handler.num_filesystems(), 1);
        assert!(handler.detach_filesystem(3));
        assert_eq!(handler.num_filesystems(), 0);
    }

    #[test]
    fn test_convert_all_to_attr() {
        let (_dir, source) = kv_handler();
        let fs_root = tempdir().unwrap();
        let target = FmdHandler::new(
            AttrBackend::new(Arc::new(MemoryFileIo::default())),
            Arc::new(LocalFileIo),
        );
        assert!(target.attach_filesystem(3, fs_root.path(), &AttachOptions::default()));

        for fid in 1..=3 {
            let mut record = Record::new(fid, 3);
            record.checksum = format!("{fid:08x}");
            assert!(source.commit(&mut record));
        }
        let mut existing = Record::new(2, 3);
        existing.checksum = "keep".into();
        assert!(target.commit(&mut existing));

        assert_eq!(source.convert_all_to(3, &target), 2);
        assert_eq!(target.retrieve(1, 3).unwrap(), source.retrieve(1, 3).unwrap());
        assert_eq!(target.retrieve(2, 3).unwrap().checksum, "keep");
        assert_eq!(source.convert_all_to(3, &target), 0);
    }

    #[test]
    fn test_move_to_orphans() {
        let dir = tempdir().unwrap();
        let io = Arc::new(MemoryFileIo::default());
        let handler = FmdHandler::new(KvBackend::new(), io.clone());
        let path = fid_prefix_to_full_path(7, dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"data").unwrap();

        let target = handler.move_to_orphans(&path).unwrap();
        assert_eq!(target, dir.path().join(ORPHANS_DIR).join("00000007"));
        assert!(target.is_file());
        assert!(!path.exists());
        assert_eq!(
            io.attr_get_string(&target, ATTR_ORPHANED).unwrap().unwrap(),
            path.to_string_lossy()
        );

        assert!(handler.move_to_orphans(Path::new("/x")).is_none());
    }
}
