//! Attribute backend: the record lives in the replica's `user.eos.fmd`
//!
//! There is no filesystem-wide store object. Iteration walks the directory
//! tree below the filesystem root and visits every file carrying the
//! attribute, skipping dot-entries and block checksum side-files.

use super::{AttachOptions, MetadataBackend, Visit};
use crate::error::{BackendError, BackendResult};
use crate::io::{ATTR_FMD, FileIo, is_missing, is_no_attr, replica_files};
use crate::record::Record;
use fmd_common::config::BackendKind;
use fmd_common::{FileId, FsId, fid_prefix_to_full_path};
use parking_lot::RwLock;
use prost::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Maps a file id to the physical replica path below a filesystem root
pub trait PathResolver: Send + Sync {
    fn replica_path(&self, root: &Path, fid: FileId) -> PathBuf;
}

/// `<root>/<%08x of fid / 10000>/<fid hex>`
#[derive(Clone, Copy, Debug, Default)]
pub struct HashedPathResolver;

impl PathResolver for HashedPathResolver {
    fn replica_path(&self, root: &Path, fid: FileId) -> PathBuf {
        fid_prefix_to_full_path(fid, root)
    }
}

/// Record store embedded in replica extended attributes
pub struct AttrBackend {
    io: Arc<dyn FileIo>,
    resolver: Arc<dyn PathResolver>,
    roots: RwLock<HashMap<FsId, PathBuf>>,
}

impl AttrBackend {
    pub fn new(io: Arc<dyn FileIo>) -> Self {
        Self::with_resolver(io, Arc::new(HashedPathResolver))
    }

    pub fn with_resolver(io: Arc<dyn FileIo>, resolver: Arc<dyn PathResolver>) -> Self {
        Self {
            io,
            resolver,
            roots: RwLock::new(HashMap::new()),
        }
    }

    fn root(&self, fsid: FsId) -> BackendResult<PathBuf> {
        self.roots
            .read()
            .get(&fsid)
            .cloned()
            .ok_or(BackendError::NotAttached(fsid))
    }

    fn path(&self, fsid: FsId, fid: FileId) -> BackendResult<PathBuf> {
        Ok(self.resolver.replica_path(&self.root(fsid)?, fid))
    }

    fn read_record(&self, path: &Path) -> BackendResult<Option<Record>> {
        match self.io.attr_get(path, ATTR_FMD) {
            Ok(Some(bytes)) => Ok(Some(Record::decode(bytes.as_slice())?)),
            Ok(None) => Ok(None),
            Err(e) if is_missing(&e) || is_no_attr(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl MetadataBackend for AttrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Attr
    }

    fn attach_filesystem(
        &self,
        fsid: FsId,
        path: &Path,
        _options: &AttachOptions,
    ) -> BackendResult<()> {
        let stat = self.io.stat(path)?;
        if stat.is_file {
            return Err(BackendError::Io(std::io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }
        info!("Attached fsid={} root={}", fsid, path.display());
        self.roots.write().insert(fsid, path.to_path_buf());
        Ok(())
    }

    fn detach_filesystem(&self, fsid: FsId) -> bool {
        self.roots.write().remove(&fsid).is_some()
    }

    fn is_attached(&self, fsid: FsId) -> bool {
        self.roots.read().contains_key(&fsid)
    }

    fn filesystems(&self) -> Vec<FsId> {
        let mut ids: Vec<FsId> = self.roots.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn retrieve(&self, fsid: FsId, fid: FileId) -> BackendResult<Option<Record>> {
        let path = self.path(fsid, fid)?;
        self.read_record(&path)
    }

    fn put(&self, fsid: FsId, fid: FileId, record: &Record) -> BackendResult<()> {
        let path = self.path(fsid, fid)?;
        match self.io.stat(&path) {
            Ok(_) => {}
            Err(e) if is_missing(&e) => {
                // Records may precede the replica data, e.g. on open for write
                if let Some(parent) = path.parent() {
                    self.io.mkdir_all(parent)?;
                }
                self.io.touch(&path)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.io.attr_set(&path, ATTR_FMD, &record.encode_to_vec())?;
        Ok(())
    }

    fn remove(&self, fsid: FsId, fid: FileId) -> BackendResult<()> {
        let path = self.path(fsid, fid)?;
        match self.io.attr_remove(&path, ATTR_FMD) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) || is_no_attr(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn for_each(
        &self,
        fsid: FsId,
        visit: &mut dyn FnMut(&mut Record) -> Visit,
    ) -> BackendResult<()> {
        let root = self.root(fsid)?;
        let mut rewrites = 0_u64;
        for path in replica_files(&root) {
            let mut record = match self.read_record(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to read record of {}: {}", path.display(), e);
                    continue;
                }
            };
            if visit(&mut record) == Visit::Rewrite {
                self.io.attr_set(&path, ATTR_FMD, &record.encode_to_vec())?;
                rewrites += 1;
            }
        }
        debug!("Rewrote {} records on fsid={}", rewrites, fsid);
        Ok(())
    }

    fn count(&self, fsid: FsId) -> BackendResult<u64> {
        let mut count = 0;
        self.for_each(fsid, &mut |_| {
            count += 1;
            Visit::Keep
        })?;
        Ok(count)
    }

    fn clear(&self, fsid: FsId) -> BackendResult<()> {
        let root = self.root(fsid)?;
        for path in replica_files(&root) {
            match self.io.attr_remove(&path, ATTR_FMD) {
                Ok(()) => {}
                Err(e) if is_missing(&e) || is_no_attr(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn compact(&self, _fsid: FsId) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryFileIo;
    use tempfile::tempdir;

    fn attached() -> (tempfile::TempDir, Arc<MemoryFileIo>, AttrBackend) {
        let dir = tempdir().unwrap();
        let io = Arc::new(MemoryFileIo::default());
        let backend = AttrBackend::new(io.clone());
        backend
            .attach_filesystem(5, dir.path(), &AttachOptions::default())
            .unwrap();
        (dir, io, backend)
    }

    #[test]
    fn test_put_creates_placeholder() {
        let (dir, io, backend) = attached();
        let record = Record::new(42, 5);
        backend.put(5, 42, &record).unwrap();

        let path = dir.path().join("00000000").join("0000002a");
        assert!(path.is_file());
        assert!(io.attr_get(&path, ATTR_FMD).unwrap().is_some());
        assert_eq!(backend.retrieve(5, 42).unwrap(), Some(record));
    }

    #[test]
    fn test_retrieve_missing() {
        let (_dir, _io, backend) = attached();
        assert!(backend.retrieve(5, 7).unwrap().is_none());
        backend.remove(5, 7).unwrap();
        assert!(matches!(
            backend.retrieve(6, 7),
            Err(BackendError::NotAttached(6))
        ));
    }

    #[test]
    fn test_walk_skips_hidden_and_side_files() {
        let (dir, io, backend) = attached();
        for fid in [1, 2, 3] {
            backend.put(5, fid, &Record::new(fid, 5)).unwrap();
        }

        let hidden = dir.path().join(".eosorphans");
        std::fs::create_dir_all(&hidden).unwrap();
        let orphan = hidden.join("00000009");
        std::fs::write(&orphan, b"").unwrap();
        io.attr_set(&orphan, ATTR_FMD, &Record::new(9, 5).encode_to_vec())
            .unwrap();

        let side = dir.path().join("00000000").join("00000001.xsmap");
        std::fs::write(&side, b"").unwrap();
        io.attr_set(&side, ATTR_FMD, &Record::new(1, 5).encode_to_vec())
            .unwrap();

        std::fs::write(dir.path().join("00000000").join("00000004"), b"").unwrap();

        assert_eq!(backend.count(5).unwrap(), 3);
        backend.clear(5).unwrap();
        assert_eq!(backend.count(5).unwrap(), 0);
    }

    #[test]
    fn test_for_each_rewrite() {
        let (_dir, _io, backend) = attached();
        let mut record = Record::new(11, 5);
        record.mgmsize = 10;
        backend.put(5, 11, &record).unwrap();

        backend
            .for_each(5, &mut |record| {
                record.reset_mgm();
                Visit::Rewrite
            })
            .unwrap();
        assert_eq!(
            backend.retrieve(5, 11).unwrap().unwrap().mgmsize,
            fmd_common::UNDEF
        );
    }
}
