//! Per-filesystem lock table
//!
//! One read/write lock per filesystem id, created on first use and kept for
//! the lifetime of the table. Readers (get, statistics) share the lock,
//! writers (commit, updates, resets, ghost removal) hold it exclusively.

use dashmap::DashMap;
use fmd_common::FsId;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct FsLockTable {
    locks: DashMap<FsId, Arc<RwLock<()>>>,
}

impl FsLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for a filesystem, created atomically on first use
    pub fn get(&self, fsid: FsId) -> Arc<RwLock<()>> {
        // The entry guard must be released before the caller locks
        self.locks.entry(fsid).or_default().value().clone()
    }

    /// Run `f` holding the filesystem lock shared
    pub fn read<R>(&self, fsid: FsId, f: impl FnOnce() -> R) -> R {
        let lock = self.get(fsid);
        let _guard = lock.read();
        f()
    }

    /// Run `f` holding the filesystem lock exclusively
    pub fn write<R>(&self, fsid: FsId, f: impl FnOnce() -> R) -> R {
        let lock = self.get(fsid);
        let _guard = lock.write();
        f()
    }

    /// Number of filesystems that have been locked so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_lazy_creation() {
        let table = FsLockTable::new();
        assert!(table.is_empty());
        let a = table.get(1);
        let b = table.get(1);
        assert!(Arc::ptr_eq(&a, &b));
        table.read(2, || ());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_writers_serialized_per_filesystem() {
        let table = Arc::new(FsLockTable::new());
        let inside = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        table.write(7, || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_readers_share() {
        let table = FsLockTable::new();
        let lock = table.get(3);
        let _outer = lock.read();
        // A second reader on the same filesystem must not block
        assert_eq!(table.read(3, || 5), 5);
        // Writers on other filesystems are independent
        assert_eq!(table.write(4, || 6), 6);
    }
}
