//! Cache writer — the single writer per host.
//!
//! A rebuild replaces the whole cache for a new generation. The effect is
//! atomic for readers even though the work is not: the rw-flag goes to
//! `writing` first (release), every lookup started after that misses, and
//! the flag returns to `readable` (release) only after the data region, the
//! serialized radix, and the version word are all in place. Readers that
//! were already mid-lookup when the flag flipped re-validate the version on
//! exit, so a torn generation is never returned.
//!
//! Single-writer is a deployment contract enforced by the coordination
//! lease; this type does not detect dueling writers.

use std::thread;

use log::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::{CacheIdx, CacheKey};
use crate::layout::{
    self, check_magic, write_magic, IndexHeader, DATA_OFFSET, RADIX_OFFSET, RW_READABLE,
    RW_WRITING,
};
use crate::radix::RadixTree;
use crate::region::MappedRegion;

/// How many times to re-check `reader-count` before giving up and rebuilding
/// anyway. Stale readers detect the version change on exit.
const READER_SPIN_BUDGET: u32 = 10_000;

/// Orchestrator-visible status of a completed rebuild attempt. Failures are
/// `Err(CacheError)` instead and map to [`STATUS_FAILURE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The full columnlet list was cached.
    Complete,
    /// The columnlet list was empty; the rebuild still committed (empty
    /// radix, new version).
    NoWorkToDo,
    /// A columnlet did not fit. The rebuild committed the prefix that did;
    /// the radix reflects exactly what fit.
    CapacityExceeded,
}

pub const STATUS_FAILURE: i32 = -1;

impl WriteStatus {
    /// Numeric code published to the orchestrator: 0 ok, 2 capacity
    /// exceeded.
    pub fn code(self) -> i32 {
        match self {
            WriteStatus::Complete | WriteStatus::NoWorkToDo => 0,
            WriteStatus::CapacityExceeded => 2,
        }
    }
}

pub struct CacheWriter {
    index: MappedRegion,
    cache: MappedRegion,
    radix: RadixTree,
}

impl CacheWriter {
    /// Map both files. With `overwrite`, or when either magic is missing,
    /// the files are initialized from scratch; otherwise the radix is
    /// reconstructed from the existing index so rebuilds can resume against
    /// a warm cache.
    pub fn new(config: &CacheConfig, overwrite: bool) -> Result<Self, CacheError> {
        let index = MappedRegion::new(&config.index_location, config.index_size)?;
        let cache = MappedRegion::new(&config.cache_location, config.cache_size)?;

        let reuse = !overwrite && check_magic(&index)? && check_magic(&cache)?;
        let radix = if reuse {
            let radix = RadixTree::reconstruct(&index)?;
            debug!(
                "reusing cache at {:?}: version {}, {} entries",
                config.index_location,
                IndexHeader::new(&index).version()?,
                radix.len()
            );
            radix
        } else {
            write_magic(&index)?;
            write_magic(&cache)?;
            IndexHeader::new(&index).reset()?;
            let radix = RadixTree::new();
            radix.serialize(&index, RADIX_OFFSET)?;
            radix
        };

        Ok(Self { index, cache, radix })
    }

    pub fn version(&self) -> Result<u32, CacheError> {
        IndexHeader::new(&self.index).version()
    }

    /// Keys currently in the in-memory radix.
    pub fn entries(&self) -> usize {
        self.radix.len()
    }

    /// Rebuild the cache for generation `version` from an ordered columnlet
    /// stream. Each item is the key plus its bytes, fetched lazily from the
    /// external reader; a fetch error aborts the rebuild and leaves the
    /// rw-flag at `writing` so the next attempt can retry.
    pub fn update_all<I>(&mut self, version: u32, columnlets: I) -> Result<WriteStatus, CacheError>
    where
        I: IntoIterator<Item = Result<(CacheKey, Vec<u8>), CacheError>>,
    {
        let header = IndexHeader::new(&self.index);

        header.set_rw_flag(RW_WRITING)?;
        self.wait_for_readers(&header)?;

        self.radix.remove_all();
        let mut cursor = DATA_OFFSET as u64;
        let mut cached = 0usize;
        let mut overflowed = false;

        for item in columnlets {
            let (key, bytes) = item?;
            match self.append(&mut cursor, &bytes) {
                Ok(offset) => {
                    self.radix.put(key, CacheIdx::new(offset, bytes.len() as u32));
                    cached += 1;
                }
                Err(CacheError::CapacityExceeded { need, remaining }) => {
                    warn!(
                        "cache full at columnlet {cached}: need {need} bytes, {remaining} remain"
                    );
                    overflowed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        // Commit: what fit is real, even on overflow.
        self.radix.serialize(&self.index, RADIX_OFFSET)?;
        header.set_version(version)?;
        header.set_rw_flag(RW_READABLE)?;
        debug!(
            "rebuild committed: version {version}, {cached} columnlets, {} data bytes",
            cursor - DATA_OFFSET as u64
        );

        Ok(if overflowed {
            WriteStatus::CapacityExceeded
        } else if cached == 0 {
            WriteStatus::NoWorkToDo
        } else {
            WriteStatus::Complete
        })
    }

    /// Copy `bytes` at the cursor; returns the data-region-relative offset.
    fn append(&self, cursor: &mut u64, bytes: &[u8]) -> Result<u64, CacheError> {
        let len = bytes.len() as u64;
        let size = self.cache.len() as u64;
        if *cursor + len > size {
            return Err(CacheError::CapacityExceeded {
                need:      len,
                remaining: size - *cursor,
            });
        }
        self.cache.put_bytes(*cursor as usize, bytes)?;
        let offset = *cursor - DATA_OFFSET as u64;
        *cursor += len;
        Ok(offset)
    }

    fn wait_for_readers(&self, header: &IndexHeader<'_>) -> Result<(), CacheError> {
        let mut tries = 0u32;
        while header.readers()? != 0 {
            tries += 1;
            if tries >= READER_SPIN_BUDGET {
                warn!(
                    "proceeding with rebuild while {} reader(s) linger",
                    header.readers()?
                );
                break;
            }
            thread::yield_now();
        }
        Ok(())
    }

    /// Flush both mappings back to their files.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.index.flush()?;
        self.cache.flush()
    }

    /// Unmap both files. The writer is unusable afterwards.
    pub fn close(&mut self) {
        self.index.unmap();
        self.cache.unmap();
    }

    #[cfg(test)]
    pub(crate) fn index_region(&self) -> &MappedRegion {
        &self.index
    }
}

/// Snapshot of the index header, for the `status` CLI and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStatus {
    pub magic_ok: bool,
    pub writing:  bool,
    pub readers:  u32,
    pub version:  u32,
}

/// Inspect an existing index file without taking write authority.
pub fn inspect(config: &CacheConfig) -> Result<CacheStatus, CacheError> {
    let index = MappedRegion::new(&config.index_location, config.index_size)?;
    let header = IndexHeader::new(&index);
    Ok(CacheStatus {
        magic_ok: layout::check_magic(&index)?,
        writing:  header.rw_flag()? == RW_WRITING,
        readers:  header.readers()?,
        version:  header.version()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, cache_size: u64) -> CacheConfig {
        CacheConfig {
            cache_location:    dir.path().join("pixels.cache"),
            cache_size,
            index_location:    dir.path().join("pixels.index"),
            index_size:        64 * 1024,
            enabled:           true,
            read_direct:       false,
            absolute_balancer: false,
            lease_ttl_seconds: 10,
        }
    }

    fn columnlet(b: u64, rg: u16, c: u16, len: usize) -> Result<(CacheKey, Vec<u8>), CacheError> {
        Ok((CacheKey::new(b, rg, c), vec![b as u8; len]))
    }

    #[test]
    fn empty_rebuild_commits_new_version() {
        let dir = TempDir::new().unwrap();
        let mut w = CacheWriter::new(&config(&dir, 10_000), true).unwrap();
        let status = w.update_all(1, std::iter::empty()).unwrap();
        assert_eq!(status, WriteStatus::NoWorkToDo);
        assert_eq!(status.code(), 0);
        assert_eq!(w.version().unwrap(), 1);
        assert_eq!(w.entries(), 0);

        let snap = inspect(&config(&dir, 10_000)).unwrap();
        assert!(snap.magic_ok);
        assert!(!snap.writing);
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn capacity_boundary_is_size_minus_header() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 10_000);

        let mut w = CacheWriter::new(&cfg, true).unwrap();
        let exact = w
            .update_all(1, vec![columnlet(1, 0, 0, 10_000 - DATA_OFFSET)])
            .unwrap();
        assert_eq!(exact, WriteStatus::Complete);

        let over = w
            .update_all(2, vec![columnlet(1, 0, 0, 10_000 - DATA_OFFSET + 1)])
            .unwrap();
        assert_eq!(over, WriteStatus::CapacityExceeded);
        assert_eq!(over.code(), 2);
        assert_eq!(w.entries(), 0);
        assert_eq!(w.version().unwrap(), 2);
    }

    #[test]
    fn source_failure_leaves_writing_state() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 10_000);
        let mut w = CacheWriter::new(&cfg, true).unwrap();

        let items = vec![
            columnlet(1, 0, 0, 64),
            Err(CacheError::SourceIo("connection reset".into())),
        ];
        assert!(matches!(
            w.update_all(1, items),
            Err(CacheError::SourceIo(_))
        ));
        let snap = inspect(&cfg).unwrap();
        assert!(snap.writing);
        assert_eq!(snap.version, 0);

        // The next rebuild recovers.
        let status = w.update_all(1, vec![columnlet(1, 0, 0, 64)]).unwrap();
        assert_eq!(status, WriteStatus::Complete);
        assert!(!inspect(&cfg).unwrap().writing);
    }

    #[test]
    fn reopen_without_overwrite_reconstructs_radix() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 10_000);
        {
            let mut w = CacheWriter::new(&cfg, true).unwrap();
            w.update_all(3, vec![columnlet(9, 1, 2, 128), columnlet(9, 1, 3, 256)])
                .unwrap();
            w.flush().unwrap();
        }
        let w = CacheWriter::new(&cfg, false).unwrap();
        assert_eq!(w.entries(), 2);
        assert_eq!(w.version().unwrap(), 3);
    }
}
