//! In-memory collaborators for tests

use crate::io::{FileIo, FileStat, LocalFileIo};
use crate::namespace::{MgmTransport, NamespaceDb, NamespaceError, NsFileMd, TransportError};
use fmd_common::{FileId, FsId};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Real files and directories, extended attributes kept in a map
#[derive(Default)]
pub struct MemoryFileIo {
    attrs: Mutex<HashMap<PathBuf, HashMap<String, Vec<u8>>>>,
}

impl MemoryFileIo {
    pub fn set_str(&self, path: &Path, name: &str, value: &str) {
        self.attr_set(path, name, value.as_bytes()).unwrap();
    }
}

impl FileIo for MemoryFileIo {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        LocalFileIo.stat(path)
    }

    fn attr_get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        if !path.exists() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok(self
            .attrs
            .lock()
            .get(path)
            .and_then(|attrs| attrs.get(name))
            .cloned())
    }

    fn attr_set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        if !path.exists() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.attrs
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn attr_remove(&self, path: &Path, name: &str) -> io::Result<()> {
        if !path.exists() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.attrs
            .lock()
            .get_mut(path)
            .and_then(|attrs| attrs.remove(name))
            .map(drop)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        LocalFileIo.touch(path)
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        LocalFileIo.mkdir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        LocalFileIo.rename(from, to)?;
        let mut attrs = self.attrs.lock();
        if let Some(moved) = attrs.remove(from) {
            attrs.insert(to.to_path_buf(), moved);
        }
        Ok(())
    }
}

/// Scripted MGM transport recording every request
#[derive(Default)]
pub struct StubTransport {
    responses: Mutex<VecDeque<Result<Option<String>, TransportError>>>,
    by_fid: Mutex<HashMap<String, String>>,
    dump: Mutex<String>,
    requests: Mutex<Vec<(String, String)>>,
}

impl StubTransport {
    pub fn push_ok(&self, response: &str) {
        self.responses
            .lock()
            .push_back(Ok(Some(response.to_string())));
    }

    pub fn push_empty(&self) {
        self.responses.lock().push_back(Ok(None));
    }

    pub fn push_err(&self, code: u16, message: &str) {
        self.responses
            .lock()
            .push_back(Err(TransportError::new(code, message)));
    }

    /// Answer every `getfmd` for `fid` with `env` once the script is empty
    pub fn serve(&self, fid: FileId, env: &str) {
        self.by_fid
            .lock()
            .insert(format!("{fid:08x}"), format!("getfmd: retc=0 {env}"));
    }

    pub fn set_dump(&self, content: &str) {
        *self.dump.lock() = content.to_string();
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

impl MgmTransport for StubTransport {
    fn query(
        &self,
        manager: &str,
        request: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        self.requests
            .lock()
            .push((manager.to_string(), request.to_string()));
        if let Some(scripted) = self.responses.lock().pop_front() {
            return scripted;
        }
        let fid = request.rsplit('=').next().unwrap_or_default();
        Ok(self.by_fid.lock().get(fid).cloned())
    }

    fn dump(&self, manager: &str, request: &str, output: &Path) -> Result<(), TransportError> {
        self.requests
            .lock()
            .push((manager.to_string(), request.to_string()));
        std::fs::write(output, self.dump.lock().as_bytes())
            .map_err(|e| TransportError::new(500, e.to_string()))
    }
}

/// Namespace database held in memory
#[derive(Default)]
pub struct MemoryNamespaceDb {
    files: Mutex<HashMap<FileId, NsFileMd>>,
    index: Mutex<HashMap<FsId, Vec<FileId>>>,
    failing: Mutex<HashMap<FileId, i32>>,
}

impl MemoryNamespaceDb {
    /// Register a file and index it on each of its locations
    pub fn insert(&self, md: NsFileMd) {
        let mut index = self.index.lock();
        for fsid in &md.locations {
            index.entry(*fsid).or_default().push(md.id);
        }
        self.files.lock().insert(md.id, md);
    }

    /// Index a file id on a filesystem without a file object
    pub fn index_only(&self, fsid: FsId, fid: FileId) {
        self.index.lock().entry(fsid).or_default().push(fid);
    }

    /// Make fetches of `fid` fail with `errno`
    pub fn fail(&self, fid: FileId, errno: i32) {
        self.failing.lock().insert(fid, errno);
    }
}

impl NamespaceDb for MemoryNamespaceDb {
    fn filesystem_file_ids(&self, fsid: FsId) -> Result<Vec<FileId>, NamespaceError> {
        Ok(self.index.lock().get(&fsid).cloned().unwrap_or_default())
    }

    fn fetch_file(&self, fid: FileId) -> BoxFuture<'static, Result<NsFileMd, NamespaceError>> {
        let result = if let Some(errno) = self.failing.lock().get(&fid) {
            Err(NamespaceError::Db {
                errno: *errno,
                message: "injected".to_string(),
            })
        } else {
            self.files
                .lock()
                .get(&fid)
                .cloned()
                .ok_or(NamespaceError::NotFound(fid))
        };
        future::ready(result).boxed()
    }
}
