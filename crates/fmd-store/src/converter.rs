//! Online migration of records between backends
//!
//! Records are copied from a source handler to a target handler by a fixed
//! pool of worker threads. Records already present at the target are left
//! alone, so an interrupted conversion can simply be restarted. Dropping the
//! [`Converter`] drains the queue and joins the workers.

use crate::backend::MetadataBackend;
use crate::handler::FmdHandler;
use crate::io::replica_files;
use crossbeam_channel::{Receiver, Sender};
use fmd_common::config::ConverterConfig;
use fmd_common::{FsId, fid_from_path};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Marker left in a filesystem root once every replica was converted
pub const CONVERTED_MARKER: &str = ".eosattrconverted";

type Job = Box<dyn FnOnce() + Send>;

/// Pending result of a single conversion
#[must_use]
pub struct ConversionTask {
    result: Receiver<bool>,
}

impl ConversionTask {
    fn done(ok: bool) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(ok);
        Self { result: rx }
    }

    /// Block until the conversion finished
    pub fn wait(self) -> bool {
        self.result.recv().unwrap_or(false)
    }
}

pub struct Converter<S: MetadataBackend + 'static, T: MetadataBackend + 'static> {
    source: Arc<FmdHandler<S>>,
    target: Arc<FmdHandler<T>>,
    jobs: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<S: MetadataBackend + 'static, T: MetadataBackend + 'static> Converter<S, T> {
    /// Start the worker pool
    pub fn new(
        source: Arc<FmdHandler<S>>,
        target: Arc<FmdHandler<T>>,
        config: &ConverterConfig,
    ) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let count = config.effective_workers();
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("fmd-convert-{i}"))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        info!("Converter started with {} workers", count);

        Ok(Self {
            source,
            target,
            jobs: Some(tx),
            workers,
        })
    }

    /// Queue the conversion of the replica at `path`
    pub fn convert(&self, fsid: FsId, path: PathBuf) -> ConversionTask {
        let Some(jobs) = &self.jobs else {
            return ConversionTask::done(false);
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let source = Arc::clone(&self.source);
        let target = Arc::clone(&self.target);
        let job: Job = Box::new(move || {
            let _ = tx.send(convert_one(&source, &target, fsid, &path));
        });

        if jobs.send(job).is_err() {
            error!("Converter queue closed");
            return ConversionTask::done(false);
        }
        ConversionTask { result: rx }
    }

    /// Convert every replica below `fs_path`
    ///
    /// Skipped entirely when the marker from a previous complete run is
    /// present. The marker is only written when every replica converted.
    pub fn convert_fs(&self, fs_path: &Path, fsid: FsId) -> bool {
        let marker = fs_path.join(CONVERTED_MARKER);
        if self.target.io().stat(&marker).is_ok() {
            info!("fsid={} already converted", fsid);
            return true;
        }

        let start = Instant::now();
        let tasks: Vec<ConversionTask> = replica_files(fs_path)
            .map(|path| self.convert(fsid, path))
            .collect();
        let total = tasks.len();
        let failed = tasks
            .into_iter()
            .map(ConversionTask::wait)
            .filter(|ok| !ok)
            .count();

        if failed > 0 {
            warn!(
                "Conversion of fsid={} incomplete: {}/{} failed",
                fsid, failed, total
            );
            return false;
        }

        if let Err(e) = self.target.io().touch(&marker) {
            error!("Failed to write {}: {}", marker.display(), e);
            return false;
        }
        info!(
            "Converted {} files of fsid={} in {:?}",
            total,
            fsid,
            start.elapsed()
        );
        true
    }
}

fn convert_one<S: MetadataBackend, T: MetadataBackend>(
    source: &FmdHandler<S>,
    target: &FmdHandler<T>,
    fsid: FsId,
    path: &Path,
) -> bool {
    let fid = fid_from_path(path);
    if fid == 0 {
        warn!("No file id in {}", path.display());
        return false;
    }

    if target.retrieve(fid, fsid).is_some() {
        debug!("fid={:08x} already converted", fid);
        return true;
    }

    let Some(record) = source.retrieve(fid, fsid) else {
        debug!("No record for fid={:08x} on fsid={}", fid, fsid);
        return true;
    };

    if target.restore(&record) {
        true
    } else {
        error!("Failed to convert fid={:08x} fsid={}", fid, fsid);
        false
    }
}

impl<S: MetadataBackend + 'static, T: MetadataBackend + 'static> Drop for Converter<S, T> {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and drained
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Converter worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttachOptions, AttrBackend, KvBackend};
    use crate::record::Record;
    use crate::testing::MemoryFileIo;
    use fmd_common::fid_prefix_to_full_path;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _meta: TempDir,
        fs: TempDir,
        source: Arc<FmdHandler<KvBackend>>,
        target: Arc<FmdHandler<AttrBackend>>,
    }

    fn fixture() -> Fixture {
        let meta = tempdir().unwrap();
        let fs = tempdir().unwrap();
        let io = Arc::new(MemoryFileIo::default());

        let source = FmdHandler::new(KvBackend::new(), io.clone());
        assert!(source.attach_filesystem(3, meta.path(), &AttachOptions::default()));
        let target = FmdHandler::new(AttrBackend::new(io.clone()), io);
        assert!(target.attach_filesystem(3, fs.path(), &AttachOptions::default()));

        Fixture {
            _meta: meta,
            fs,
            source: Arc::new(source),
            target: Arc::new(target),
        }
    }

    fn add(fx: &Fixture, fid: u64) -> PathBuf {
        let path = fid_prefix_to_full_path(fid, fx.fs.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"data").unwrap();
        let mut record = Record::new(fid, 3);
        record.disksize = 4;
        record.size = 4;
        assert!(fx.source.commit(&mut record));
        path
    }

    fn converter(fx: &Fixture) -> Converter<KvBackend, AttrBackend> {
        Converter::new(
            Arc::clone(&fx.source),
            Arc::clone(&fx.target),
            &ConverterConfig { workers: 4 },
        )
        .unwrap()
    }

    #[test]
    fn test_convert_fs() {
        let fx = fixture();
        for fid in 1..=20 {
            add(&fx, fid);
        }
        let converter = converter(&fx);

        assert!(converter.convert_fs(fx.fs.path(), 3));
        assert!(fx.fs.path().join(CONVERTED_MARKER).exists());
        for fid in 1..=20 {
            assert_eq!(
                fx.target.retrieve(fid, 3),
                fx.source.retrieve(fid, 3),
                "fid {fid}"
            );
        }
    }

    #[test]
    fn test_marker_skips_conversion() {
        let fx = fixture();
        add(&fx, 1);
        let converter = converter(&fx);
        assert!(converter.convert_fs(fx.fs.path(), 3));

        add(&fx, 2);
        assert!(converter.convert_fs(fx.fs.path(), 3));
        assert!(fx.target.retrieve(2, 3).is_none());
    }

    #[test]
    fn test_existing_target_record_kept() {
        let fx = fixture();
        let path = add(&fx, 5);
        let mut existing = Record::new(5, 3);
        existing.mgmsize = 99;
        assert!(fx.target.restore(&existing));

        let converter = converter(&fx);
        assert!(converter.convert(3, path).wait());
        assert_eq!(fx.target.retrieve(5, 3).unwrap().mgmsize, 99);
    }

    #[test]
    fn test_convert_rejects_bad_path() {
        let fx = fixture();
        let converter = converter(&fx);
        assert!(!converter.convert(3, fx.fs.path().join("junk")).wait());
    }

    #[test]
    fn test_drop_drains_queue() {
        let fx = fixture();
        let paths: Vec<PathBuf> = (1..=50).map(|fid| add(&fx, fid)).collect();
        let converter = converter(&fx);
        let tasks: Vec<ConversionTask> = paths
            .into_iter()
            .map(|path| converter.convert(3, path))
            .collect();
        drop(converter);

        assert!(tasks.into_iter().all(ConversionTask::wait));
        assert_eq!(fx.target.num_files(3), 50);
    }
}
