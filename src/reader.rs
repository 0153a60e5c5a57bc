//! Cache reader — wait-free lookups over the shared mapped files.
//!
//! # Lookup protocol
//!
//! 1. Read the rw-flag; a writer in progress means an immediate miss — the
//!    critical section is never entered.
//! 2. Fetch-add reader-count by +1.
//! 3. Re-read the flag. A writer may have flipped it between 1 and 2 without
//!    observing our increment; re-checking after the increment closes that
//!    race. Back out (decrement) and miss if it flipped.
//! 4. Pin the version.
//! 5. Walk the serialized radix in place (no heap copy).
//! 6. On a hit, re-read the version; a change means a whole rebuild
//!    completed underneath us and the locator may describe the old
//!    generation — miss.
//! 7. Decrement reader-count (a scoped guard covers every exit path).
//! 8. Slice the cache file at the locator.
//!
//! Readers run concurrently with no mutual exclusion; the only shared
//! mutation is the reader-count word. A reader never surfaces an error:
//! corruption degrades to a miss, logged once, and the caller falls through
//! to the distributed filesystem.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::{CacheIdx, CacheKey};
use crate::layout::{check_magic, IndexHeader, DATA_OFFSET, RW_READABLE};
use crate::radix::disk;
use crate::region::MappedRegion;

pub struct CacheReader {
    /// `None` when `cache.enabled = false`; every lookup misses.
    files:          Option<Files>,
    read_direct:    bool,
    corrupt_logged: AtomicBool,
}

struct Files {
    index: MappedRegion,
    cache: MappedRegion,
}

/// Balances the reader-count increment on every exit path.
struct ReaderGuard<'a> {
    header: IndexHeader<'a>,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        let _ = self.header.dec_readers();
    }
}

impl CacheReader {
    /// Map both files and validate their magics. With `cache.enabled =
    /// false` nothing is mapped and the reader is a permanent miss.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let files = if config.enabled {
            let index = MappedRegion::new(&config.index_location, config.index_size)?;
            let cache = MappedRegion::new(&config.cache_location, config.cache_size)?;
            if !check_magic(&index)? {
                return Err(CacheError::CorruptIndex("bad index magic".into()));
            }
            if !check_magic(&cache)? {
                return Err(CacheError::CorruptIndex("bad cache magic".into()));
            }
            Some(Files { index, cache })
        } else {
            None
        };
        Ok(Self {
            files,
            read_direct: config.read_direct,
            corrupt_logged: AtomicBool::new(false),
        })
    }

    /// The locator for `key` in the current generation, or a miss.
    pub fn locate(&self, key: CacheKey) -> Option<CacheIdx> {
        let files = self.files.as_ref()?;
        let header = IndexHeader::new(&files.index);

        if header.rw_flag().ok()? != RW_READABLE {
            return None;
        }
        header.inc_readers().ok()?;
        let _guard = ReaderGuard { header };

        if header.rw_flag().ok()? != RW_READABLE {
            return None;
        }
        let v0 = header.version().ok()?;

        let idx = match disk::lookup(&files.index, key) {
            Ok(found) => found?,
            Err(e) => {
                self.log_corrupt_once(key, &e);
                return None;
            }
        };

        // A rebuild completed mid-walk: the locator may belong to the old
        // generation while the bytes belong to the new one.
        if header.version().ok()? != v0 {
            return None;
        }
        Some(idx)
    }

    /// Zero-copy lookup. The slice borrows the mapping and must not be
    /// retained across [`CacheReader::close`].
    pub fn get(&self, key: CacheKey) -> Option<&[u8]> {
        let idx = self.locate(key)?;
        let files = self.files.as_ref()?;
        files
            .cache
            .get_bytes(DATA_OFFSET + idx.offset as usize, idx.length as usize)
            .ok()
    }

    /// Heap-copy lookup, for callers that outlive the mapping.
    pub fn get_direct(&self, key: CacheKey) -> Option<Vec<u8>> {
        self.get(key).map(<[u8]>::to_vec)
    }

    /// Lookup honoring `cache.read.direct`.
    pub fn read(&self, key: CacheKey) -> Option<Cow<'_, [u8]>> {
        if self.read_direct {
            self.get_direct(key).map(Cow::Owned)
        } else {
            self.get(key).map(Cow::Borrowed)
        }
    }

    /// Current cache generation, if the cache is enabled.
    pub fn version(&self) -> Option<u32> {
        let files = self.files.as_ref()?;
        IndexHeader::new(&files.index).version().ok()
    }

    /// Unmap both files. Outstanding slices must be gone by now (the borrow
    /// checker enforces this in-process).
    pub fn close(&mut self) {
        if let Some(files) = &mut self.files {
            files.index.unmap();
            files.cache.unmap();
        }
        self.files = None;
    }

    fn log_corrupt_once(&self, key: CacheKey, e: &CacheError) {
        if !self.corrupt_logged.swap(true, Ordering::Relaxed) {
            warn!(
                "index parse failed for key {} — treating as miss: {e}",
                hex::encode(key.to_bytes())
            );
        }
    }
}
