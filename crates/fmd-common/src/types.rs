//! Core identifiers for the replica metadata engine
//!
//! File ids are unique within the namespace, filesystem ids are unique within
//! the storage cluster. Replica files are named after the hex form of their
//! file id and spread over sub-directories of 10000 ids each.

use std::path::{Path, PathBuf};

/// File identifier, unique per namespace
pub type FileId = u64;

/// Filesystem identifier, unique per storage cluster
pub type FsId = u32;

/// Sentinel for a size that has not been observed yet
pub const UNDEF: u64 = 0xffff_ffff_fff1;

/// Number of file ids grouped in one replica sub-directory
pub const FIDS_PER_DIR: u64 = 10_000;

/// Render a file id the way replica files are named (`%08x`)
#[must_use]
pub fn fid_to_hex(fid: FileId) -> String {
    format!("{fid:08x}")
}

/// Parse a hex file name back into a file id
///
/// Invalid input yields 0, which is never a valid file id.
#[must_use]
pub fn hex_to_fid(hex: &str) -> FileId {
    FileId::from_str_radix(hex.trim(), 16).unwrap_or(0)
}

/// Extract the file id encoded in the final component of a replica path
#[must_use]
pub fn fid_from_path(path: &Path) -> FileId {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(0, hex_to_fid)
}

/// Build the full replica path below a filesystem prefix
///
/// The layout is `<prefix>/<%08x of fid / 10000>/<fid hex>`.
#[must_use]
pub fn fid_prefix_to_full_path(fid: FileId, prefix: &Path) -> PathBuf {
    prefix
        .join(format!("{:08x}", fid / FIDS_PER_DIR))
        .join(fid_to_hex(fid))
}

/// Returns true if the path names an auxiliary side-file that never holds
/// replica data (block checksum maps)
#[must_use]
pub fn is_side_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "xsmap")
}
