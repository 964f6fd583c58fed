//! Disk collaborator contract
//!
//! Everything the engine needs from the physical replica: a stat, the
//! extended attributes written by the scrubber and the I/O path, and the
//! few namespace operations used when quarantining orphans.

use fmd_common::is_side_file;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Checksum algorithm name written by the I/O path
pub const ATTR_CHECKSUM_TYPE: &str = "user.eos.checksumtype";
/// Binary file checksum
pub const ATTR_CHECKSUM: &str = "user.eos.checksum";
/// `"1"` when the last scrub found a file checksum error
pub const ATTR_FILE_XS_ERROR: &str = "user.eos.filecxerror";
/// `"1"` when the last scrub found a block checksum error
pub const ATTR_BLOCK_XS_ERROR: &str = "user.eos.blockcxerror";
/// Last scrub time, seconds (legacy writers used microseconds)
pub const ATTR_TIMESTAMP: &str = "user.eos.timestamp";
/// Serialized record, attribute backend only
pub const ATTR_FMD: &str = "user.eos.fmd";
/// Original path of a quarantined replica
pub const ATTR_ORPHANED: &str = "user.eos.orphaned";

/// Result of a stat on a replica path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
}

/// Physical file access used by the backends and resync protocols
pub trait FileIo: Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Read an attribute, `None` when it is not set
    fn attr_get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>>;

    fn attr_set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()>;

    fn attr_remove(&self, path: &Path, name: &str) -> io::Result<()>;

    /// Create an empty file if none exists
    fn touch(&self, path: &Path) -> io::Result<()>;

    fn mkdir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Attribute decoded as UTF-8, `None` when unset or not text
    fn attr_get_string(&self, path: &Path, name: &str) -> io::Result<Option<String>> {
        Ok(self
            .attr_get(path, name)?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }
}

/// Local filesystem with user extended attributes
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileIo;

impl FileIo for LocalFileIo {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            size: meta.len(),
            is_file: meta.is_file(),
        })
    }

    fn attr_get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        match xattr::get(path, name) {
            Ok(value) => Ok(value),
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn attr_set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        xattr::set(path, name, value)
    }

    fn attr_remove(&self, path: &Path, name: &str) -> io::Result<()> {
        xattr::remove(path, name)
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(drop)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// True when an I/O error means the path does not exist
#[must_use]
pub fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(libc::ENOENT | libc::ENOTDIR))
}

/// True when an attribute error means the attribute is not set
#[must_use]
pub fn is_no_attr(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENODATA))
}

/// Replica files below a filesystem root
///
/// Dot-entries below the root (quarantine, markers) and block checksum
/// side-files are skipped. Unreadable entries are logged and skipped.
pub fn replica_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && !is_side_file(entry.path()))
        .map(DirEntry::into_path)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_stat_and_touch() {
        let dir = tempdir().unwrap();
        let io = LocalFileIo;
        let path = dir.path().join("a").join("0000002a");

        assert!(io.stat(&path).is_err_and(|e| is_missing(&e)));

        io.mkdir_all(path.parent().unwrap()).unwrap();
        io.touch(&path).unwrap();
        let stat = io.stat(&path).unwrap();
        assert!(stat.is_file);
        assert_eq!(stat.size, 0);

        assert!(!io.stat(dir.path()).unwrap().is_file);
    }

    #[test]
    fn test_local_rename() {
        let dir = tempdir().unwrap();
        let io = LocalFileIo;
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        std::fs::write(&from, b"data").unwrap();
        io.rename(&from, &to).unwrap();
        assert_eq!(io.stat(&to).unwrap().size, 4);
        assert!(io.stat(&from).is_err());
    }

    #[test]
    fn test_replica_files() {
        let dir = tempdir().unwrap();
        let hashed = dir.path().join("00000000");
        std::fs::create_dir_all(&hashed).unwrap();
        std::fs::create_dir_all(dir.path().join(".eosorphans")).unwrap();
        for name in ["0000002a", "0000002b", "0000002a.xsmap"] {
            std::fs::write(hashed.join(name), b"").unwrap();
        }
        std::fs::write(dir.path().join(".eosorphans").join("00000007"), b"").unwrap();
        std::fs::write(dir.path().join(".eosattrconverted"), b"").unwrap();

        let mut found: Vec<PathBuf> = replica_files(dir.path()).collect();
        found.sort();
        assert_eq!(found, vec![hashed.join("0000002a"), hashed.join("0000002b")]);
    }

    #[test]
    fn test_missing_errors() {
        assert!(is_missing(&io::Error::from_raw_os_error(libc::ENOTDIR)));
        assert!(!is_missing(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(is_no_attr(&io::Error::from_raw_os_error(libc::ENODATA)));
    }
}
