//! MGM transport answering from a metadata dump file
//!
//! Lets the namespace resync run without a reachable metadata server: the
//! dump taken earlier with `fs dumpmd` serves both single-file queries and
//! the bulk dump request.

use fmd_store::env::Env;
use fmd_store::namespace::{MgmTransport, TransportError};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const FID_PARAM: &str = "mgm.getfmd.fid=";

pub struct DumpFileTransport {
    path: PathBuf,
    by_fid: HashMap<String, String>,
}

impl DumpFileTransport {
    /// Load and index a dump file by file id
    pub fn open(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut by_fid = HashMap::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            match Env::parse(line).get_num("id", 10) {
                Some(fid) => {
                    by_fid.insert(format!("{fid:08x}"), line.to_string());
                }
                None => warn!("Dump line without file id: {}", line),
            }
        }
        debug!("Indexed {} entries from {}", by_fid.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            by_fid,
        })
    }

    pub fn entries(&self) -> usize {
        self.by_fid.len()
    }
}

impl MgmTransport for DumpFileTransport {
    fn query(
        &self,
        _manager: &str,
        request: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        let Some((_, fid)) = request.split_once(FID_PARAM) else {
            return Err(TransportError::new(400, format!("unsupported request {request}")));
        };
        let fid = fid.split('&').next().unwrap_or_default();
        Ok(self
            .by_fid
            .get(fid)
            .map(|line| format!("getfmd: retc=0 {line}")))
    }

    fn dump(&self, _manager: &str, _request: &str, output: &Path) -> Result<(), TransportError> {
        fs::copy(&self.path, output)
            .map(drop)
            .map_err(|e| TransportError::new(500, e.to_string()))
    }
}
