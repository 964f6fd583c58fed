//! fmd-inspect - Replica metadata inspector
//!
//! Administrative front-end composing a metadata handler over one
//! filesystem: inconsistency statistics, disk and namespace resyncs, ghost
//! cleanup, backend conversion and record dumps.

mod offline;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fmd_common::config::{BackendKind, FmdConfig};
use fmd_common::{FileId, FsId, hex_to_fid};
use fmd_store::{
    AttachOptions, AttrBackend, Converter, FileIo, FmdHandler, KvBackend, LocalFileIo,
    MetadataBackend, MgmClient,
};
use offline::DumpFileTransport;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fmd-inspect")]
#[command(about = "Inspect and repair replica metadata records")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FMD_CONFIG", default_value = "/etc/fmd/fmd.toml")]
    config: String,

    /// Record store backend, overrides the configuration file
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Directory of the key-value databases, overrides the configuration file
    #[arg(long)]
    meta_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Filesystem the command works on
#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// Filesystem id
    #[arg(long)]
    fsid: FsId,

    /// Filesystem root holding the replicas
    #[arg(long)]
    path: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print inconsistency statistics as JSON
    Stats {
        #[command(flatten)]
        target: Target,
    },
    /// Rebuild the disk view of every record from the replicas
    ResyncDisk {
        #[command(flatten)]
        target: Target,

        /// Flag every scanned replica as orphaned
        #[arg(long)]
        flag_orphans: bool,
    },
    /// Rebuild the namespace view of records from a metadata dump
    ResyncMgm {
        #[command(flatten)]
        target: Target,

        /// Dump file produced by `fs dumpmd`
        #[arg(long)]
        dump: PathBuf,

        /// Resync only this file id (hex)
        #[arg(long, value_parser = parse_fid)]
        fid: Option<FileId>,
    },
    /// Remove records of orphaned or unregistered replicas gone from disk
    Ghosts {
        #[command(flatten)]
        target: Target,
    },
    /// Copy every record into the other backend
    Convert {
        #[command(flatten)]
        target: Target,

        /// Destination backend
        #[arg(long)]
        to: BackendKind,
    },
    /// Print records in environment format
    Dump {
        #[command(flatten)]
        target: Target,

        /// Print only this file id (hex)
        #[arg(long, value_parser = parse_fid)]
        fid: Option<FileId>,
    },
}

impl Commands {
    const fn target(&self) -> &Target {
        match self {
            Self::Stats { target }
            | Self::ResyncDisk { target, .. }
            | Self::ResyncMgm { target, .. }
            | Self::Ghosts { target }
            | Self::Convert { target, .. }
            | Self::Dump { target, .. } => target,
        }
    }
}

fn parse_fid(s: &str) -> std::result::Result<FileId, String> {
    match hex_to_fid(s) {
        0 => Err(format!("invalid file id: {s}")),
        fid => Ok(fid),
    }
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(flatten)]
    fmd: FmdConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default = "default_log_format")]
    format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Bind a filesystem to the handler at the location its backend expects
fn attach<B: MetadataBackend>(
    handler: &FmdHandler<B>,
    target: &Target,
    config: &FmdConfig,
) -> Result<()> {
    let location = match handler.backend().kind() {
        BackendKind::Kv => config.store.meta_dir.as_path(),
        BackendKind::Attr => target.path.as_path(),
    };
    let options = AttachOptions::with_cache_mb(config.store.cache_size_mb);
    if !handler.attach_filesystem(target.fsid, location, &options) {
        bail!(
            "failed to attach fsid={} at {}",
            target.fsid,
            location.display()
        );
    }
    Ok(())
}

fn kv_handler(io: &Arc<dyn FileIo>, config: &FmdConfig) -> FmdHandler<KvBackend> {
    FmdHandler::with_config(KvBackend::new(), Arc::clone(io), config)
}

fn attr_handler(io: &Arc<dyn FileIo>, config: &FmdConfig) -> FmdHandler<AttrBackend> {
    FmdHandler::with_config(AttrBackend::new(Arc::clone(io)), Arc::clone(io), config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    if let Some(backend) = args.backend {
        config.fmd.store.backend = backend;
    }
    if let Some(meta_dir) = args.meta_dir.clone() {
        config.fmd.store.meta_dir = meta_dir;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    let log_format = args
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    init_logging(&log_level, &log_format);

    config.fmd.validate()?;
    info!("Config file: {}", args.config);
    info!("Backend: {}", config.fmd.store.backend);

    let io: Arc<dyn FileIo> = Arc::new(LocalFileIo);
    match config.fmd.store.backend {
        BackendKind::Kv => run(Arc::new(kv_handler(&io, &config.fmd)), &io, &args, &config.fmd),
        BackendKind::Attr => {
            run(Arc::new(attr_handler(&io, &config.fmd)), &io, &args, &config.fmd)
        }
    }
}

fn run<B: MetadataBackend + 'static>(
    handler: Arc<FmdHandler<B>>,
    io: &Arc<dyn FileIo>,
    args: &Args,
    config: &FmdConfig,
) -> Result<()> {
    let target = args.command.target();
    attach(&handler, target, config)?;
    let fsid = target.fsid;

    match &args.command {
        Commands::Stats { .. } => {
            let stats = handler.inconsistency_statistics(fsid)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::ResyncDisk { flag_orphans, .. } => {
            if !handler.resync_all_disk(&target.path, fsid, *flag_orphans) {
                bail!("disk resync of fsid={fsid} failed");
            }
            println!("{} records", handler.num_files(fsid));
        }
        Commands::ResyncMgm { dump, fid, .. } => {
            let transport = DumpFileTransport::open(dump)
                .with_context(|| format!("reading dump {}", dump.display()))?;
            info!("Loaded {} dump entries", transport.entries());
            let client = MgmClient::new(transport, config.mgm.clone());
            let ok = match fid {
                Some(fid) => handler.resync_mgm(fsid, *fid, None, &client),
                None => handler.resync_all_mgm(fsid, None, &client),
            };
            if !ok {
                bail!("namespace resync of fsid={fsid} failed");
            }
            println!("{} records", handler.num_files(fsid));
        }
        Commands::Ghosts { .. } => {
            let Some(removed) = handler.remove_ghost_entries(&target.path, fsid) else {
                bail!("fsid={fsid} is syncing, ghost removal skipped");
            };
            for fid in &removed {
                println!("{fid:08x}");
            }
            info!("Removed {} ghost records", removed.len());
        }
        Commands::Convert { to, .. } => {
            if *to == handler.backend().kind() {
                bail!("records of fsid={fsid} are already in the {to} backend");
            }
            let converted = match to {
                BackendKind::Kv => convert(&handler, kv_handler(io, config), target, config)?,
                BackendKind::Attr => {
                    convert(&handler, attr_handler(io, config), target, config)?
                }
            };
            if !converted {
                bail!("conversion of fsid={fsid} incomplete");
            }
        }
        Commands::Dump { fid, .. } => match fid {
            Some(fid) => match handler.retrieve(*fid, fsid) {
                Some(record) => println!("{}", record.to_env()),
                None => bail!("fid={fid:08x} not found on fsid={fsid}"),
            },
            None => {
                for record in handler.records(fsid)? {
                    println!("{}", record.to_env());
                }
            }
        },
    }

    if !handler.detach_filesystem(fsid) {
        error!("Failed to detach fsid={}", fsid);
    }
    Ok(())
}

fn convert<S: MetadataBackend + 'static, T: MetadataBackend + 'static>(
    source: &Arc<FmdHandler<S>>,
    destination: FmdHandler<T>,
    target: &Target,
    config: &FmdConfig,
) -> Result<bool> {
    attach(&destination, target, config)?;
    let destination = Arc::new(destination);
    let converter = Converter::new(Arc::clone(source), Arc::clone(&destination), &config.converter)
        .context("starting converter workers")?;
    let ok = converter.convert_fs(&target.path, target.fsid);
    drop(converter);
    info!(
        "fsid={} now holds {} records in the {} backend",
        target.fsid,
        destination.num_files(target.fsid),
        destination.backend().kind()
    );
    Ok(ok)
}
