//! Disk resync
//!
//! Reads what the scrubber and the I/O path left on the physical replica
//! and folds it into the disk axis of the record.

use super::ResyncError;
use crate::backend::MetadataBackend;
use crate::handler::{DiskInfo, FmdHandler};
use crate::io::{
    ATTR_BLOCK_XS_ERROR, ATTR_CHECKSUM, ATTR_CHECKSUM_TYPE, ATTR_FILE_XS_ERROR, ATTR_TIMESTAMP,
    replica_files,
};
use fmd_common::{ChecksumType, FsId, fid_from_path};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Seconds part of a scrub timestamp; legacy writers stored microseconds
fn parse_timestamp(raw: &str) -> u64 {
    let seconds: String = raw.trim().chars().take(10).collect();
    seconds.parse().unwrap_or_default()
}

impl<B: MetadataBackend> FmdHandler<B> {
    fn attr_flag(&self, path: &Path, name: &str) -> bool {
        matches!(self.io.attr_get_string(path, name), Ok(Some(v)) if v == "1")
    }

    /// Resync one replica from disk
    ///
    /// A size and checksum already computed by a scrub (`hint_size` non-zero
    /// and `hint_checksum` non-empty) are trusted over the checksum
    /// attribute. Fails with `ENOENT` when the path is not a regular file.
    pub fn resync_disk(
        &self,
        path: &Path,
        fsid: FsId,
        flag_layout_error: bool,
        hint_size: u64,
        hint_checksum: &str,
    ) -> Result<(), ResyncError> {
        let fid = fid_from_path(path);
        if fid == 0 {
            return Err(ResyncError::InvalidFid(path.to_path_buf()));
        }

        let stat = match self.io.stat(path) {
            Ok(stat) if stat.is_file => stat,
            Ok(_) => return Err(ResyncError::NotOnDisk(path.to_path_buf())),
            Err(e) => {
                debug!("Failed to stat {}: {}", path.display(), e);
                return Err(ResyncError::NotOnDisk(path.to_path_buf()));
            }
        };

        let check_time = self
            .io
            .attr_get_string(path, ATTR_TIMESTAMP)
            .ok()
            .flatten()
            .map_or(0, |raw| parse_timestamp(&raw));

        let (size, checksum) = if hint_size != 0 && !hint_checksum.is_empty() {
            (hint_size, hint_checksum.to_string())
        } else {
            let xs_type = self
                .io
                .attr_get_string(path, ATTR_CHECKSUM_TYPE)
                .ok()
                .flatten()
                .and_then(|name| name.parse::<ChecksumType>().ok());
            let digest = self.io.attr_get(path, ATTR_CHECKSUM).ok().flatten();
            let hex = match (xs_type, digest) {
                (Some(xs), Some(digest)) => xs.hex_from_binary(&digest),
                _ => String::new(),
            };
            (stat.size, hex)
        };

        let info = DiskInfo {
            size,
            checksum,
            check_time,
            file_xs_error: self.attr_flag(path, ATTR_FILE_XS_ERROR),
            block_xs_error: self.attr_flag(path, ATTR_BLOCK_XS_ERROR),
            flag_layout_error,
        };

        if self.update_with_disk_info(fsid, fid, &info) {
            Ok(())
        } else {
            error!("Failed to update disk info of {}", path.display());
            Err(ResyncError::UpdateFailed { fid, fsid })
        }
    }

    /// Reset the disk axis, then resync every replica below `fs_root`
    pub fn resync_all_disk(&self, fs_root: &Path, fsid: FsId, flag_layout_error: bool) -> bool {
        self.set_sync_status(fsid, true);
        let ok = self.resync_all_disk_inner(fs_root, fsid, flag_layout_error);
        self.set_sync_status(fsid, false);
        ok
    }

    fn resync_all_disk_inner(&self, fs_root: &Path, fsid: FsId, flag_layout_error: bool) -> bool {
        if !self.reset_disk_information(fsid) {
            error!("Failed to reset disk information of fsid={}", fsid);
            return false;
        }

        if let Err(e) = self.io.stat(fs_root) {
            error!("Cannot scan {}: {}", fs_root.display(), e);
            return false;
        }

        let start = Instant::now();
        let interval = self.scan.progress_interval.max(1);
        let mut scanned = 0_u64;
        for path in replica_files(fs_root) {
            if let Err(e) = self.resync_disk(&path, fsid, flag_layout_error, 0, "") {
                warn!("Disk resync of {} failed: {}", path.display(), e);
            }
            scanned += 1;
            if scanned % interval == 0 {
                info!("Disk resync of fsid={} at {} files", fsid, scanned);
            }
        }

        info!(
            "Disk resync of fsid={} done: {} files in {:?}",
            fsid,
            scanned,
            start.elapsed()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttachOptions, KvBackend};
    use crate::handler::GetOptions;
    use crate::io::FileIo;
    use crate::testing::MemoryFileIo;
    use fmd_common::{LayoutFlag, UNDEF, fid_prefix_to_full_path};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _meta: TempDir,
        fs: TempDir,
        io: Arc<MemoryFileIo>,
        handler: FmdHandler<KvBackend>,
    }

    fn fixture() -> Fixture {
        let meta = tempdir().unwrap();
        let fs = tempdir().unwrap();
        let io = Arc::new(MemoryFileIo::default());
        let handler = FmdHandler::new(KvBackend::new(), io.clone());
        assert!(handler.attach_filesystem(3, meta.path(), &AttachOptions::default()));
        Fixture {
            _meta: meta,
            fs,
            io,
            handler,
        }
    }

    fn replica(fx: &Fixture, fid: u64, data: &[u8]) -> std::path::PathBuf {
        let path = fid_prefix_to_full_path(fid, fx.fs.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_timestamp_clamp() {
        assert_eq!(parse_timestamp("1700000000"), 1_700_000_000);
        assert_eq!(parse_timestamp("1700000000123456"), 1_700_000_000);
        assert_eq!(parse_timestamp("garbage"), 0);
    }

    #[test]
    fn test_resync_disk_reads_attributes() {
        let fx = fixture();
        let path = replica(&fx, 42, b"hello");
        fx.io.set_str(&path, ATTR_CHECKSUM_TYPE, "adler");
        fx.io
            .attr_set(&path, ATTR_CHECKSUM, &[0x06, 0x2c, 0x02, 0x15, 0xff])
            .unwrap();
        fx.io.set_str(&path, ATTR_TIMESTAMP, "1700000000999999");
        fx.io.set_str(&path, ATTR_BLOCK_XS_ERROR, "1");

        fx.handler.resync_disk(&path, 3, false, 0, "").unwrap();
        let record = fx.handler.retrieve(42, 3).unwrap();
        assert_eq!(record.disksize, 5);
        assert_eq!(record.diskchecksum, "062c0215");
        assert_eq!(record.checksum, "062c0215");
        assert_eq!(record.checktime, 1_700_000_000);
        assert!(record.block_xs_error());
        assert!(!record.file_xs_error());
    }

    #[test]
    fn test_resync_disk_trusts_hints() {
        let fx = fixture();
        let path = replica(&fx, 42, b"hello");
        fx.handler
            .resync_disk(&path, 3, true, 4096, "abcd1234")
            .unwrap();
        let record = fx.handler.retrieve(42, 3).unwrap();
        assert_eq!(record.disksize, 4096);
        assert_eq!(record.diskchecksum, "abcd1234");
        assert!(record.layout_errors().contains(LayoutFlag::Orphan));
    }

    #[test]
    fn test_resync_disk_errors() {
        let fx = fixture();
        let err = fx
            .handler
            .resync_disk(&fx.fs.path().join("bogus"), 3, false, 0, "")
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);

        let gone = fid_prefix_to_full_path(9, fx.fs.path());
        let err = fx.handler.resync_disk(&gone, 3, false, 0, "").unwrap_err();
        assert!(matches!(err, ResyncError::NotOnDisk(_)));
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_resync_all_disk() {
        let fx = fixture();
        replica(&fx, 1, b"a");
        replica(&fx, 2, b"bb");
        std::fs::write(fid_prefix_to_full_path(2, fx.fs.path()).with_extension("xsmap"), b"")
            .unwrap();

        // A record whose replica vanished reads back as unknown
        let mut stale = fx
            .handler
            .get(3, 3, &GetOptions::create(0, 0, 0x0010_0002))
            .unwrap();
        stale.disksize = 77;
        assert!(fx.handler.commit(&mut stale));

        assert!(fx.handler.resync_all_disk(fx.fs.path(), 3, false));
        assert!(!fx.handler.is_syncing(3));
        assert_eq!(fx.handler.retrieve(1, 3).unwrap().disksize, 1);
        assert_eq!(fx.handler.retrieve(2, 3).unwrap().disksize, 2);
        assert_eq!(fx.handler.retrieve(3, 3).unwrap().disksize, UNDEF);
        assert_eq!(fx.handler.num_files(3), 3);
    }
}
