//! Namespace resync through the metadata server
//!
//! A lookup that cleanly reports absence turns into an orphan record. A
//! failed lookup changes nothing.

use crate::backend::MetadataBackend;
use crate::env::Env;
use crate::handler::{FmdHandler, GetOptions, MgmInfo};
use crate::namespace::{MgmClient, MgmTransport, record_from_mgm_env};
use crate::record::Record;
use fmd_common::{FileId, FsId, LayoutFlag, UNDEF};
use std::io::{BufRead, BufReader};
use std::time::Instant;
use tracing::{debug, error, info, warn};

impl<B: MetadataBackend> FmdHandler<B> {
    /// Resync one file from the metadata server
    ///
    /// Entries known neither on disk nor at the namespace are deleted.
    pub fn resync_mgm<T: MgmTransport>(
        &self,
        fsid: FsId,
        fid: FileId,
        manager: Option<&str>,
        client: &MgmClient<T>,
    ) -> bool {
        let mut ns = match client.get_fmd(manager, fid) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!("File fid={:08x} not found on MGM", fid);
                if fid == 0 {
                    return self.delete(0, fsid);
                }
                Record::new(fid, fsid)
            }
            Err(e) => {
                error!("Failed to retrieve MGM record of fid={:08x}: {}", fid, e);
                return false;
            }
        };
        ns.set_layout_errors(ns.layout_error(fsid));
        let errors = ns.layout_errors();

        match self.get(fid, fsid, &GetOptions::forced()) {
            Some(local) => {
                if local.disksize == UNDEF && errors.contains(LayoutFlag::Unregistered) {
                    warn!("Removing ghost record fid={:08x} fsid={}", fid, fsid);
                    return self.delete(fid, fsid);
                }
            }
            None => {
                if errors.intersects(&[LayoutFlag::Unregistered, LayoutFlag::Orphan]) {
                    // Not here and not supposed to be here
                    return true;
                }
            }
        }

        let create = GetOptions::create(ns.uid, ns.gid, ns.lid).force();
        let Some(local) = self.get(fid, fsid, &create) else {
            error!("Failed to create record fid={:08x} fsid={}", fid, fsid);
            return false;
        };

        if local.disksize == UNDEF && ns.mgmsize != 0 {
            warn!("Marking missing replica fid={:08x} fsid={}", fid, fsid);
            ns.add_layout_flag(LayoutFlag::Missing);
        }

        if !self.update_with_mgm_info(fsid, fid, &MgmInfo::from_record(&ns)) {
            error!("Failed to update record fid={:08x} with MGM info", fid);
            return false;
        }

        if local.disksize == UNDEF && ns.mgmsize == UNDEF {
            warn!("Removing ghost record fid={:08x} fsid={}", fid, fsid);
            return self.delete(fid, fsid);
        }
        true
    }

    /// Reset the namespace axis, then resync from a metadata dump
    pub fn resync_all_mgm<T: MgmTransport>(
        &self,
        fsid: FsId,
        manager: Option<&str>,
        client: &MgmClient<T>,
    ) -> bool {
        self.set_sync_status(fsid, true);
        let ok = self.resync_all_mgm_inner(fsid, manager, client);
        self.set_sync_status(fsid, false);
        ok
    }

    fn resync_all_mgm_inner<T: MgmTransport>(
        &self,
        fsid: FsId,
        manager: Option<&str>,
        client: &MgmClient<T>,
    ) -> bool {
        if !self.reset_mgm_information(fsid) {
            error!("Failed to reset MGM information of fsid={}", fsid);
            return false;
        }

        let dump = match client.fetch_dump(manager, fsid) {
            Ok(dump) => dump,
            Err(e) => {
                error!("Failed to dump metadata of fsid={}: {}", fsid, e);
                return false;
            }
        };

        let start = Instant::now();
        let interval = self.scan.progress_interval.max(1);
        let mut count = 0_u64;
        for line in BufReader::new(dump.as_file()).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read metadata dump of fsid={}: {}", fsid, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            count += 1;
            debug!("line={}", line);
            self.apply_dump_entry(fsid, &line);

            if count % interval == 0 {
                info!("Synced {} files so far on fsid={}", count, fsid);
            }
        }

        info!(
            "MGM resync of fsid={} done: {} entries in {:?}",
            fsid,
            count,
            start.elapsed()
        );
        true
    }

    fn apply_dump_entry(&self, fsid: FsId, line: &str) {
        let Some(mut ns) = record_from_mgm_env(&Env::parse(line)) else {
            error!("Failed to convert dump entry: {}", line);
            return;
        };
        let fid = ns.fid;
        let create = GetOptions::create(ns.uid, ns.gid, ns.lid).force();
        let Some(local) = self.get(fid, fsid, &create) else {
            error!("Failed to get/create record for dump entry: {}", line);
            return;
        };

        ns.set_layout_errors(ns.layout_error(fsid));
        if local.disksize == UNDEF && ns.mgmsize != 0 {
            warn!("Found missing replica fid={:08x} on fsid={}", fid, fsid);
            ns.add_layout_flag(LayoutFlag::Missing);
        }

        if !self.update_with_mgm_info(fsid, fid, &MgmInfo::from_record(&ns)) {
            error!("Failed to update record from dump entry: {}", line);
        }
    }
}
