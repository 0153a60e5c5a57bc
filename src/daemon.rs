//! Cache daemon — ties the writer to its collaborators.
//!
//! Each poll: renew the write lease, look for a plan one generation past the
//! installed version, announce the rebuild on the bus, stream the plan's
//! columnlets through the writer, publish the numeric status back to the
//! coordination store, announce completion. Lease loss and missing plan keys
//! are "nothing to do", not errors.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::bus::{MappedBus, DEFAULT_RECORD_SIZE, MSG_UPDATE_BEGIN, MSG_UPDATE_DONE};
use crate::config::CacheConfig;
use crate::coordination::{CachePlan, CoordinationStore};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::source::BlockSource;
use crate::writer::{CacheWriter, STATUS_FAILURE};

/// Size of the notification bus file next to the index file.
pub const BUS_SIZE: u64 = 64 * 1024;

/// Bus file path: `{index.location}.bus`.
pub fn bus_path(config: &CacheConfig) -> PathBuf {
    suffixed(config, ".bus")
}

/// Stop sentinel path: `{index.location}.stop`.
pub fn stop_path(config: &CacheConfig) -> PathBuf {
    suffixed(config, ".stop")
}

fn suffixed(config: &CacheConfig, suffix: &str) -> PathBuf {
    let mut s = config.index_location.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Lazily expands a [`CachePlan`] into `(key, bytes)` items: per path, open
/// the block (optionally localized first), then fetch each columnlet up to
/// the cache border in plan order. The first failure is yielded once and the
/// stream ends, so the writer sees exactly one `SourceIo`.
pub struct PlanColumnlets<'a, S: BlockSource> {
    source:   &'a mut S,
    plan:     &'a CachePlan,
    localize: bool,
    path_idx: usize,
    pair_idx: usize,
    block_id: Option<u64>,
    failed:   bool,
}

impl<'a, S: BlockSource> PlanColumnlets<'a, S> {
    pub fn new(source: &'a mut S, plan: &'a CachePlan, localize: bool) -> Self {
        Self {
            source,
            plan,
            localize,
            path_idx: 0,
            pair_idx: 0,
            block_id: None,
            failed: false,
        }
    }

    fn fail(&mut self, e: CacheError) -> Option<Result<(CacheKey, Vec<u8>), CacheError>> {
        self.failed = true;
        Some(Err(e))
    }
}

impl<S: BlockSource> Iterator for PlanColumnlets<'_, S> {
    type Item = Result<(CacheKey, Vec<u8>), CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.path_idx >= self.plan.paths.len() {
                return None;
            }
            let block_id = match self.block_id {
                Some(id) => id,
                None => {
                    let path = &self.plan.paths[self.path_idx];
                    let path = if self.localize {
                        match self.source.localize(path) {
                            Ok(p) => p,
                            Err(e) => return self.fail(e),
                        }
                    } else {
                        path.clone()
                    };
                    match self.source.open(&path) {
                        Ok(id) => {
                            self.block_id = Some(id);
                            self.pair_idx = 0;
                            id
                        }
                        Err(e) => return self.fail(e),
                    }
                }
            };

            let pairs = self.plan.cached_columnlets();
            if self.pair_idx >= pairs.len() {
                self.block_id = None;
                self.path_idx += 1;
                continue;
            }
            let (rg, col) = pairs[self.pair_idx];
            self.pair_idx += 1;

            let chunk = match self.source.row_group_footer(rg) {
                Ok(footer) => footer.chunk(col),
                Err(e) => return self.fail(e),
            };
            let (offset, length) = match chunk {
                Some(loc) => loc,
                None => {
                    return self.fail(CacheError::SourceIo(format!(
                        "row group {rg} has no chunk for column {col}"
                    )))
                }
            };
            return match self.source.read(offset, length) {
                Ok(bytes) => Some(Ok((CacheKey::new(block_id, rg, col), bytes))),
                Err(e) => self.fail(e),
            };
        }
    }
}

pub struct CacheDaemon<S: BlockSource, C: CoordinationStore> {
    writer:        CacheWriter,
    store:         C,
    source:        S,
    bus:           MappedBus,
    config:        CacheConfig,
    host:          String,
    poll_interval: Duration,
}

impl<S: BlockSource, C: CoordinationStore> CacheDaemon<S, C> {
    pub fn new(
        config:        CacheConfig,
        store:         C,
        source:        S,
        host:          String,
        overwrite:     bool,
        poll_interval: Duration,
    ) -> Result<Self, CacheError> {
        let writer = CacheWriter::new(&config, overwrite)?;
        let bus = MappedBus::create(bus_path(&config), BUS_SIZE, DEFAULT_RECORD_SIZE)?;
        Ok(Self { writer, store, source, bus, config, host, poll_interval })
    }

    pub fn writer(&self) -> &CacheWriter {
        &self.writer
    }

    /// One lease/plan/rebuild cycle. `Ok(None)` when there was nothing to
    /// do; otherwise the status code that was published.
    pub fn poll_once(&mut self) -> Result<Option<i32>, CacheError> {
        match self.store.acquire_lease(&self.host, self.config.lease_ttl()) {
            Ok(true) => {}
            Ok(false) => {
                debug!("write lease held by another process");
                return Ok(None);
            }
            Err(e) => {
                warn!("lease acquisition failed, skipping rebuild: {e}");
                return Ok(None);
            }
        }

        let next = self.writer.version()? + 1;
        let plan = match self.store.cache_plan(next, &self.host) {
            Ok(Some(plan)) => plan,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("no usable plan for version {next}: {e}");
                return Ok(None);
            }
        };
        info!(
            "rebuilding version {next}: {} path(s), {} columnlet(s) per path",
            plan.paths.len(),
            plan.cached_columnlets().len()
        );

        if let Err(e) = self.bus.publish(MSG_UPDATE_BEGIN, &next.to_le_bytes()) {
            warn!("bus notification failed: {e}");
        }

        let columnlets =
            PlanColumnlets::new(&mut self.source, &plan, self.config.absolute_balancer);
        let code = match self.writer.update_all(next, columnlets) {
            Ok(status) => {
                info!("rebuild {next} finished: {status:?}");
                status.code()
            }
            Err(e) => {
                error!("rebuild {next} failed: {e}");
                STATUS_FAILURE
            }
        };

        if let Err(e) = self.store.publish_status(next, &self.host, code) {
            warn!("status publication failed: {e}");
        }
        if let Err(e) = self.bus.publish(MSG_UPDATE_DONE, &next.to_le_bytes()) {
            warn!("bus notification failed: {e}");
        }
        Ok(Some(code))
    }

    /// Poll until the stop sentinel appears. The sentinel is consumed so the
    /// next start is not stillborn.
    pub fn run(&mut self) -> Result<(), CacheError> {
        let stop = stop_path(&self.config);
        info!("cache daemon running as host {:?}", self.host);
        while !stop.exists() {
            self.poll_once()?;
            std::thread::sleep(self.poll_interval);
        }
        let _ = std::fs::remove_file(&stop);
        info!("stop sentinel found, daemon exiting");
        Ok(())
    }
}
