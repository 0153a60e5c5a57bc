//! Coordination store seam — who tells this host what to cache.
//!
//! The cluster coordinator is an external service. Per generation it
//! publishes, under `cache-location/{version}/{host}`, a semicolon-delimited
//! list of source file paths, and alongside it the ordered `rowGroupId:
//! columnId` pairs with the `cacheBorder` cutoff. The writer consumes those
//! two keys and publishes `{version, host, status}` when it is done. Write
//! authority is a TTL lease owned by at most one process per host.
//!
//! [`FileCoordinationStore`] binds the contract to a plain directory of
//! files so the daemon and the tests can run without a cluster:
//!
//! ```text
//! {dir}/lease.json                    current lease holder + expiry
//! {dir}/{version}/{host}.paths       semicolon-delimited source paths
//! {dir}/{version}/layout.json        {"columnlets": ["rg:col", ...], "cacheBorder": N}
//! {dir}/{version}/{host}.status.json published completion record
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// One generation's worth of work for this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    /// Source files to cache, in order.
    pub paths: Vec<String>,
    /// Ordered `(row_group_id, column_id)` pairs; applies to every path.
    pub columnlets: Vec<(u16, u16)>,
    /// Only the first `cache_border` columnlet entries are cached.
    pub cache_border: usize,
}

impl CachePlan {
    /// The columnlet order actually cached, after the border cutoff.
    pub fn cached_columnlets(&self) -> &[(u16, u16)] {
        &self.columnlets[..self.cache_border.min(self.columnlets.len())]
    }
}

pub trait CoordinationStore {
    /// Try to take (or renew) the host's write lease for `ttl`.
    fn acquire_lease(&mut self, host: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// The plan for `(version, host)`, or `None` when the coordinator has
    /// published nothing for that generation yet.
    fn cache_plan(&mut self, version: u32, host: &str) -> Result<Option<CachePlan>, CacheError>;

    /// Publish the rebuild outcome for the orchestrator.
    fn publish_status(&mut self, version: u32, host: &str, code: i32) -> Result<(), CacheError>;
}

// ── Directory-of-files binding ───────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    host:    String,
    expires: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutRecord {
    columnlets:  Vec<String>,
    #[serde(rename = "cacheBorder")]
    cache_border: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRecord {
    pub version:   u32,
    pub host:      String,
    pub status:    i32,
    pub published: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FileCoordinationStore {
    dir: PathBuf,
}

impl FileCoordinationStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Publish a plan into the store. Coordinator-side helper, used by the
    /// tests and tooling.
    pub fn put_plan(&self, version: u32, host: &str, plan: &CachePlan) -> Result<(), CacheError> {
        let vdir = self.dir.join(version.to_string());
        fs::create_dir_all(&vdir)?;
        fs::write(vdir.join(format!("{host}.paths")), plan.paths.join(";"))?;
        let layout = LayoutRecord {
            columnlets:  plan
                .columnlets
                .iter()
                .map(|(rg, col)| format!("{rg}:{col}"))
                .collect(),
            cache_border: plan.cache_border,
        };
        fs::write(vdir.join("layout.json"), encode(&layout)?)?;
        Ok(())
    }

    pub fn read_status(&self, version: u32, host: &str) -> Result<Option<StatusRecord>, CacheError> {
        let path = self
            .dir
            .join(version.to_string())
            .join(format!("{host}.status.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        Ok(Some(decode(&raw)?))
    }
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec_pretty(v).map_err(|e| CacheError::CoordinationFailure(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(raw).map_err(|e| CacheError::CoordinationFailure(e.to_string()))
}

fn parse_pair(s: &str) -> Result<(u16, u16), CacheError> {
    let (rg, col) = s
        .split_once(':')
        .ok_or_else(|| CacheError::CoordinationFailure(format!("bad columnlet pair {s:?}")))?;
    let rg = rg
        .parse()
        .map_err(|_| CacheError::CoordinationFailure(format!("bad row group id {rg:?}")))?;
    let col = col
        .parse()
        .map_err(|_| CacheError::CoordinationFailure(format!("bad column id {col:?}")))?;
    Ok((rg, col))
}

impl CoordinationStore for FileCoordinationStore {
    fn acquire_lease(&mut self, host: &str, ttl: Duration) -> Result<bool, CacheError> {
        let path = self.dir.join("lease.json");
        let now = Utc::now();
        if let Ok(raw) = fs::read(&path) {
            let lease: LeaseRecord = decode(&raw)?;
            if lease.host != host && lease.expires > now {
                return Ok(false);
            }
        }
        let lease = LeaseRecord {
            host:    host.to_owned(),
            expires: now + chrono::Duration::from_std(ttl)
                .map_err(|e| CacheError::CoordinationFailure(e.to_string()))?,
        };
        fs::write(path, encode(&lease)?)?;
        Ok(true)
    }

    fn cache_plan(&mut self, version: u32, host: &str) -> Result<Option<CachePlan>, CacheError> {
        let vdir = self.dir.join(version.to_string());
        let paths_file = vdir.join(format!("{host}.paths"));
        if !paths_file.exists() {
            return Ok(None);
        }
        let paths_raw = fs::read_to_string(paths_file)?;
        let paths: Vec<String> = paths_raw
            .trim()
            .split(';')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();

        let layout_raw = fs::read(vdir.join("layout.json"))
            .map_err(|e| CacheError::CoordinationFailure(format!("layout missing: {e}")))?;
        let layout: LayoutRecord = decode(&layout_raw)?;
        let columnlets = layout
            .columnlets
            .iter()
            .map(|s| parse_pair(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(CachePlan {
            paths,
            columnlets,
            cache_border: layout.cache_border,
        }))
    }

    fn publish_status(&mut self, version: u32, host: &str, code: i32) -> Result<(), CacheError> {
        let vdir = self.dir.join(version.to_string());
        fs::create_dir_all(&vdir)?;
        let record = StatusRecord {
            version,
            host: host.to_owned(),
            status: code,
            published: Utc::now(),
        };
        fs::write(vdir.join(format!("{host}.status.json")), encode(&record)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plan_round_trip_and_border() {
        let dir = TempDir::new().unwrap();
        let mut store = FileCoordinationStore::new(dir.path()).unwrap();

        assert_eq!(store.cache_plan(1, "node1").unwrap(), None);

        let plan = CachePlan {
            paths:        vec!["/data/a".into(), "/data/b".into()],
            columnlets:   vec![(0, 0), (0, 1), (1, 0), (1, 1)],
            cache_border: 3,
        };
        store.put_plan(1, "node1", &plan).unwrap();

        let read = store.cache_plan(1, "node1").unwrap().unwrap();
        assert_eq!(read, plan);
        assert_eq!(read.cached_columnlets(), &[(0, 0), (0, 1), (1, 0)]);
        assert_eq!(store.cache_plan(1, "node2").unwrap(), None);
    }

    #[test]
    fn lease_excludes_other_hosts_until_expiry() {
        let dir = TempDir::new().unwrap();
        let mut store = FileCoordinationStore::new(dir.path()).unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease("node1", ttl).unwrap());
        assert!(!store.acquire_lease("node2", ttl).unwrap());
        // The holder may renew.
        assert!(store.acquire_lease("node1", ttl).unwrap());

        // An expired lease is up for grabs.
        assert!(store.acquire_lease("node1", Duration::from_secs(0)).unwrap());
        assert!(store.acquire_lease("node2", ttl).unwrap());
    }

    #[test]
    fn status_is_published_with_timestamp() {
        let dir = TempDir::new().unwrap();
        let mut store = FileCoordinationStore::new(dir.path()).unwrap();
        store.publish_status(4, "node1", 2).unwrap();
        let record = store.read_status(4, "node1").unwrap().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.status, 2);
        assert_eq!(record.host, "node1");
    }
}
