//! Namespace resync straight from the namespace database

use super::ResyncError;
use crate::backend::MetadataBackend;
use crate::handler::{FmdHandler, GetOptions, MgmInfo};
use crate::namespace::{NamespaceDb, NamespaceError, NsFileMd};
use crate::record::Record;
use fmd_common::{FileId, FsId, LayoutErrors, LayoutFlag, UNDEF};
use futures::executor::block_on;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

type PendingFetch = (FileId, BoxFuture<'static, Result<NsFileMd, NamespaceError>>);

/// Missing flag of the namespace view against the local record
fn missing_errors(ns: &Record, local: &Record) -> LayoutErrors {
    let errors = ns.layout_errors();
    if ns.mgmsize == 0 {
        errors.without(LayoutFlag::Missing)
    } else if local.disksize == UNDEF || local.layout_errors().contains(LayoutFlag::Missing) {
        errors.with(LayoutFlag::Missing)
    } else {
        errors
    }
}

impl<B: MetadataBackend> FmdHandler<B> {
    fn local_or_new(&self, fid: FileId, fsid: FsId) -> Option<Record> {
        self.get(fid, fsid, &GetOptions::forced())
            .or_else(|| self.get(fid, fsid, &GetOptions::create(0, 0, 0).force()))
    }

    /// Resync one replica against the namespace database
    ///
    /// A file the namespace does not know is quarantined under the
    /// filesystem's orphan directory and reported as
    /// [`ResyncError::Orphaned`]. A failed lookup leaves the record alone.
    pub fn resync_file_from_qdb(
        &self,
        fid: FileId,
        fsid: FsId,
        path: &Path,
        db: Option<&dyn NamespaceDb>,
    ) -> Result<(), ResyncError> {
        let Some(db) = db else {
            warn!("No namespace client to resync fid={:08x}", fid);
            return Err(ResyncError::NoClient);
        };

        let mut ns = match block_on(db.fetch_file(fid)) {
            Ok(md) => md.to_record(fsid),
            Err(e) if e.is_not_found() => Record::new(fid, fsid),
            Err(e) => {
                error!("Failed to fetch fid={:08x} from namespace: {}", fid, e);
                return Err(e.into());
            }
        };
        ns.set_layout_errors(ns.layout_error(fsid));

        let Some(mut local) = self.local_or_new(fid, fsid) else {
            error!("Failed to get/create record fid={:08x} fsid={}", fid, fsid);
            return Err(ResyncError::UpdateFailed { fid, fsid });
        };

        if ns.layout_errors().contains(LayoutFlag::Orphan) {
            self.move_to_orphans(path);
            local.set_layout_errors(LayoutErrors::only(LayoutFlag::Orphan));
            if !self.commit(&mut local) {
                error!("Failed to flag orphan fid={:08x} fsid={}", fid, fsid);
            }
            return Err(ResyncError::Orphaned(fid));
        }

        let errors = missing_errors(&ns, &local);
        ns.set_layout_errors(errors);
        if self.update_with_mgm_info(fsid, fid, &MgmInfo::from_record(&ns)) {
            Ok(())
        } else {
            error!("Failed to update fid={:08x} with namespace info", fid);
            Err(ResyncError::UpdateFailed { fid, fsid })
        }
    }

    /// Reset the namespace axis, then resync every file the namespace
    /// indexes on `fsid`
    ///
    /// Up to `qdb.prefetch` fetches are kept in flight. Files whose lookup
    /// fails for a reason other than absence are skipped.
    pub fn resync_all_from_qdb(&self, fsid: FsId, db: &dyn NamespaceDb) -> bool {
        self.set_sync_status(fsid, true);
        let ok = self.resync_all_from_qdb_inner(fsid, db);
        self.set_sync_status(fsid, false);
        ok
    }

    fn resync_all_from_qdb_inner(&self, fsid: FsId, db: &dyn NamespaceDb) -> bool {
        if !self.reset_mgm_information(fsid) {
            error!("Failed to reset MGM information of fsid={}", fsid);
            return false;
        }

        let mut fids = match db.filesystem_file_ids(fsid) {
            Ok(fids) => fids,
            Err(e) => {
                error!("Failed to list files of fsid={}: {}", fsid, e);
                return false;
            }
        };
        fids.sort_unstable();
        fids.dedup();
        let total = fids.len();
        info!("Resyncing {} files of fsid={} from namespace", total, fsid);

        let prefetch = self.qdb.prefetch.max(1);
        let interval = self.qdb.progress_interval.max(1);
        let mut pending = fids.into_iter();
        let mut in_flight: VecDeque<PendingFetch> = pending
            .by_ref()
            .take(prefetch)
            .map(|fid| (fid, db.fetch_file(fid)))
            .collect();

        let start = Instant::now();
        let mut processed = 0_u64;
        while let Some((fid, fetch)) = in_flight.pop_front() {
            if let Some(next) = pending.next() {
                in_flight.push_back((next, db.fetch_file(next)));
            }

            let ns = match block_on(fetch) {
                Ok(md) => Some(md.to_record(fsid)),
                Err(e) if e.is_not_found() => Some(Record::new(fid, fsid)),
                Err(e) => {
                    warn!("Skipping fid={:08x}: {}", fid, e);
                    None
                }
            };
            if let Some(ns) = ns {
                self.apply_qdb_entry(fsid, ns);
            }

            processed += 1;
            if processed % interval == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    processed as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    "fsid={} resynced {}/{} files at {:.02} Hz",
                    fsid, processed, total, rate
                );
            }
        }

        info!(
            "Namespace resync of fsid={} done: {} files in {:?}",
            fsid,
            processed,
            start.elapsed()
        );
        true
    }

    fn apply_qdb_entry(&self, fsid: FsId, mut ns: Record) {
        let fid = ns.fid;
        let Some(local) = self.local_or_new(fid, fsid) else {
            error!("Failed to get/create record fid={:08x} fsid={}", fid, fsid);
            return;
        };
        ns.set_layout_errors(ns.layout_error(fsid));
        if local.disksize == UNDEF && ns.mgmsize != 0 {
            ns.add_layout_flag(LayoutFlag::Missing);
        }

        if !self.update_with_mgm_info(fsid, fid, &MgmInfo::from_record(&ns)) {
            error!("Failed to update fid={:08x} with namespace info", fid);
        }
    }

    /// Fold a scrub result into the record
    ///
    /// The namespace view is refreshed first; the disk axis is only touched
    /// when that succeeded. A replica gone from disk that the namespace
    /// expects is flagged missing.
    pub fn update_with_scan_info(
        &self,
        fid: FileId,
        fsid: FsId,
        path: &Path,
        scan_size: u64,
        scan_checksum: &str,
        db: Option<&dyn NamespaceDb>,
    ) -> Result<(), ResyncError> {
        self.resync_file_from_qdb(fid, fsid, path, db)?;

        match self.resync_disk(path, fsid, false, scan_size, scan_checksum) {
            Err(ResyncError::NotOnDisk(_)) => {
                debug!("Replica fid={:08x} not on disk", fid);
                if let Some(mut record) = self.get(fid, fsid, &GetOptions::forced())
                    && record.mgmsize != 0
                {
                    record.add_layout_flag(LayoutFlag::Missing);
                    if !self.commit(&mut record) {
                        error!("Failed to flag missing fid={:08x} fsid={}", fid, fsid);
                    }
                }
                Ok(())
            }
            result => result,
        }
    }
}
