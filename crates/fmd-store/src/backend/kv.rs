//! KV backend: one redb database per filesystem
//!
//! Records are prost-encoded and keyed by the fixed-width file id. The
//! database for filesystem `n` lives at `<meta_dir>/fmd.<%04d n>.redb`.

use super::{AttachOptions, MetadataBackend, Visit};
use crate::error::{BackendError, BackendResult};
use crate::record::Record;
use fmd_common::config::BackendKind;
use fmd_common::{FileId, FsId};
use parking_lot::RwLock;
use prost::Message;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// fid -> prost-encoded record
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Record store keeping one database per attached filesystem
#[derive(Default)]
pub struct KvBackend {
    dbs: RwLock<HashMap<FsId, Arc<Database>>>,
}

impl KvBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Database file for a filesystem below `meta_dir`
    #[must_use]
    pub fn db_path(meta_dir: &Path, fsid: FsId) -> PathBuf {
        meta_dir.join(format!("fmd.{fsid:04}.redb"))
    }

    fn db(&self, fsid: FsId) -> BackendResult<Arc<Database>> {
        self.dbs
            .read()
            .get(&fsid)
            .cloned()
            .ok_or(BackendError::NotAttached(fsid))
    }

    fn open(path: &Path, options: &AttachOptions) -> BackendResult<Database> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = Database::builder();
        if let Some(bytes) = options.cache_size {
            builder.set_cache_size(bytes);
        }
        let db = builder.create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(RECORDS)?;
        }
        write_txn.commit()?;

        Ok(db)
    }
}

impl MetadataBackend for KvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kv
    }

    fn attach_filesystem(
        &self,
        fsid: FsId,
        path: &Path,
        options: &AttachOptions,
    ) -> BackendResult<()> {
        // redb refuses a second open of the same file, drop the old handle first
        if self.detach_filesystem(fsid) {
            debug!("Re-attaching fsid={}", fsid);
        }

        let db_path = Self::db_path(path, fsid);
        let db = Self::open(&db_path, options)?;
        info!("Attached fsid={} db={}", fsid, db_path.display());
        self.dbs.write().insert(fsid, Arc::new(db));
        Ok(())
    }

    fn detach_filesystem(&self, fsid: FsId) -> bool {
        self.dbs.write().remove(&fsid).is_some()
    }

    fn is_attached(&self, fsid: FsId) -> bool {
        self.dbs.read().contains_key(&fsid)
    }

    fn filesystems(&self) -> Vec<FsId> {
        let mut ids: Vec<FsId> = self.dbs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn retrieve(&self, fsid: FsId, fid: FileId) -> BackendResult<Option<Record>> {
        let db = self.db(fsid)?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        match table.get(fid)? {
            Some(bytes) => Ok(Some(Record::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, fsid: FsId, fid: FileId, record: &Record) -> BackendResult<()> {
        let db = self.db(fsid)?;
        let bytes = record.encode_to_vec();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS)?;
            table.insert(fid, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, fsid: FsId, fid: FileId) -> BackendResult<()> {
        let db = self.db(fsid)?;
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS)?;
            table.remove(fid)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn for_each(
        &self,
        fsid: FsId,
        visit: &mut dyn FnMut(&mut Record) -> Visit,
    ) -> BackendResult<()> {
        let db = self.db(fsid)?;
        let mut rewrites = Vec::new();
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let fid = key.value();
                let mut record = match Record::decode(value.value()) {
                    Ok(record) => record,
                    Err(e) => {
                        error!("Failed to decode record fid={:08x} fsid={}: {}", fid, fsid, e);
                        continue;
                    }
                };
                if visit(&mut record) == Visit::Rewrite {
                    rewrites.push((fid, record.encode_to_vec()));
                }
            }
        }

        if rewrites.is_empty() {
            return Ok(());
        }

        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS)?;
            for (fid, bytes) in &rewrites {
                table.insert(*fid, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        debug!("Rewrote {} records on fsid={}", rewrites.len(), fsid);
        Ok(())
    }

    fn count(&self, fsid: FsId) -> BackendResult<u64> {
        let db = self.db(fsid)?;
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        Ok(table.len()?)
    }

    fn clear(&self, fsid: FsId) -> BackendResult<()> {
        let db = self.db(fsid)?;
        let write_txn = db.begin_write()?;
        write_txn.delete_table(RECORDS)?;
        {
            let _t = write_txn.open_table(RECORDS)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn compact(&self, fsid: FsId) -> BackendResult<()> {
        let mut dbs = self.dbs.write();
        let db = dbs.get_mut(&fsid).ok_or(BackendError::NotAttached(fsid))?;
        match Arc::get_mut(db) {
            Some(db) => {
                let compacted = db.compact()?;
                debug!("Compacted fsid={} changed={}", fsid, compacted);
            }
            None => warn!("Skipping compaction of fsid={}: database in use", fsid),
        }
        Ok(())
    }
}
