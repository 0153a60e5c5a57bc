//! Cache configuration — the dotted keys the deployment tooling writes.
//!
//! ```json
//! {
//!   "cache.location": "/dev/shm/pixels.cache",
//!   "cache.size": 1073741824,
//!   "index.location": "/dev/shm/pixels.index",
//!   "index.size": 104857600,
//!   "cache.enabled": true,
//!   "cache.read.direct": false,
//!   "enable.absolute.balancer": false,
//!   "lease.ttl.seconds": 10
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache-file path, typically on tmpfs.
    #[serde(rename = "cache.location")]
    pub cache_location: PathBuf,

    /// Fixed byte size of the cache file.
    #[serde(rename = "cache.size")]
    pub cache_size: u64,

    /// Index-file path.
    #[serde(rename = "index.location")]
    pub index_location: PathBuf,

    /// Fixed byte size of the index file.
    #[serde(rename = "index.size")]
    pub index_size: u64,

    /// When false, readers always miss and never touch the mapped files.
    #[serde(rename = "cache.enabled", default = "default_true")]
    pub enabled: bool,

    /// When true, `CacheReader::read` hands out a heap copy instead of a
    /// mapped slice. Debug/benchmark paths only.
    #[serde(rename = "cache.read.direct", default)]
    pub read_direct: bool,

    /// Experimental: replace each source path with a host-local replica
    /// before reading. Not required for correctness.
    #[serde(rename = "enable.absolute.balancer", default)]
    pub absolute_balancer: bool,

    /// Lease TTL for write authority, enforced by the coordination store.
    #[serde(rename = "lease.ttl.seconds", default = "default_lease_ttl")]
    pub lease_ttl_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_lease_ttl() -> u64 {
    10
}

impl CacheConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| CacheError::CoordinationFailure(format!("bad config: {e}")))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CacheError> {
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| CacheError::CoordinationFailure(format!("bad config: {e}")))?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }
}
