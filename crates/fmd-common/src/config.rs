//! Configuration types for the replica metadata engine
//!
//! All sections deserialize from TOML with every field optional.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FmdConfig {
    /// Record store configuration
    pub store: StoreConfig,
    /// Namespace RPC configuration
    pub mgm: MgmConfig,
    /// Namespace database resync configuration
    pub qdb: QdbConfig,
    /// Disk scan configuration
    pub scan: ScanConfig,
    /// Backend conversion configuration
    pub converter: ConverterConfig,
}

impl FmdConfig {
    /// Check values that cannot be clamped silently
    pub fn validate(&self) -> Result<()> {
        if self.qdb.prefetch == 0 {
            return Err(Error::configuration("qdb.prefetch must be at least 1"));
        }
        if self.store.backend == BackendKind::Kv && self.store.meta_dir.as_os_str().is_empty() {
            return Err(Error::configuration("store.meta_dir is required for the kv backend"));
        }
        Ok(())
    }
}

/// Which record store a handler is bound to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One key-value database per filesystem
    #[default]
    Kv,
    /// Record embedded as an extended attribute of each replica
    Attr,
}

impl BackendKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Kv => "kv",
            Self::Attr => "attr",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kv" | "db" | "redb" => Ok(Self::Kv),
            "attr" | "xattr" | "attribute" => Ok(Self::Attr),
            _ => Err(format!("unknown backend type: {s}")),
        }
    }
}

/// Record store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend used for records
    pub backend: BackendKind,
    /// Directory holding the per-filesystem databases
    pub meta_dir: PathBuf,
    /// Page cache size for each database in MiB (0 keeps the engine default)
    pub cache_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Kv,
            meta_dir: PathBuf::from("/var/lib/fmd"),
            cache_size_mb: 0,
        }
    }
}

/// Namespace RPC configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmConfig {
    /// Manager host used when a call does not name one
    pub manager: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Fixed backoff between retries in seconds
    pub retry_backoff_secs: u64,
    /// Retries on transient status codes before giving up
    pub max_retries: u32,
}

impl MgmConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl Default for MgmConfig {
    fn default() -> Self {
        Self {
            manager: "localhost:1094".to_string(),
            request_timeout_secs: 10,
            retry_backoff_secs: 1,
            max_retries: 30,
        }
    }
}

/// Namespace database resync configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QdbConfig {
    /// Fetches kept in flight during a bulk resync
    pub prefetch: usize,
    /// Files between two progress log lines
    pub progress_interval: u64,
}

impl Default for QdbConfig {
    fn default() -> Self {
        Self {
            prefetch: 1000,
            progress_interval: 10_000,
        }
    }
}

/// Disk scan configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Files between two progress log lines
    pub progress_interval: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            progress_interval: 10_000,
        }
    }
}

/// Backend conversion configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Worker threads, clamped to 2..=100
    pub workers: usize,
}

impl ConverterConfig {
    pub const MIN_WORKERS: usize = 2;
    pub const MAX_WORKERS: usize = 100;

    /// Worker count after clamping
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(Self::MIN_WORKERS, Self::MAX_WORKERS)
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self { workers: 8 }
    }
}
