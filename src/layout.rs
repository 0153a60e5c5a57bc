//! File layouts — the format anchors for both mapped files.
//!
//! # Index file
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic         = "PIXELS" (6 ASCII bytes)
//!    6      2   rw-flag       u16  {0 = readable, 1 = writing}
//!    8      4   reader-count  u32  readers currently inside a lookup
//!   12      4   version       u32  monotonically increasing generation
//!   16      N   radix region  serialized nodes, root at offset 16
//! ```
//!
//! # Cache file
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic         = "PIXELS"
//!    6      N   data region   raw columnlet bytes, concatenated in write order
//! ```
//!
//! There is no per-entry framing in the cache file; framing lives entirely in
//! the index. Locator offsets are relative to the data region, so the usable
//! capacity of a cache file of size `S` is exactly `S - 6` bytes.
//!
//! The rw-flag, reader-count, and version are process-wide shared state.
//! [`IndexHeader`] models them as three atomic words at fixed offsets;
//! nothing else in the crate touches those offsets directly.

use crate::error::CacheError;
use crate::region::MappedRegion;

/// 6-byte sentinel at the start of each mapped file.
pub const MAGIC: &[u8; 6] = b"PIXELS";

pub const RW_FLAG_OFFSET:      usize = 6;
pub const READER_COUNT_OFFSET: usize = 8;
pub const VERSION_OFFSET:      usize = 12;
/// Byte offset of the serialized radix root in the index file.
pub const RADIX_OFFSET:        usize = 16;
/// Byte offset of the data region in the cache file.
pub const DATA_OFFSET:         usize = 6;

pub const RW_READABLE: u16 = 0;
pub const RW_WRITING:  u16 = 1;

/// Write the magic at offset 0.
pub fn write_magic(region: &MappedRegion) -> Result<(), CacheError> {
    region.put_bytes(0, MAGIC)
}

/// True iff the region starts with the magic.
pub fn check_magic(region: &MappedRegion) -> Result<bool, CacheError> {
    Ok(region.get_bytes(0, MAGIC.len())? == MAGIC)
}

/// Typed view of the index header words.
#[derive(Clone, Copy)]
pub struct IndexHeader<'a> {
    region: &'a MappedRegion,
}

impl<'a> IndexHeader<'a> {
    pub fn new(region: &'a MappedRegion) -> Self {
        Self { region }
    }

    pub fn rw_flag(&self) -> Result<u16, CacheError> {
        self.region.load_u16_acquire(RW_FLAG_OFFSET)
    }

    /// Release store: all prior writes to the index and cache regions are
    /// visible to a reader that acquires the new flag value.
    pub fn set_rw_flag(&self, flag: u16) -> Result<(), CacheError> {
        self.region.store_u16_release(RW_FLAG_OFFSET, flag)
    }

    pub fn readers(&self) -> Result<u32, CacheError> {
        self.region.load_u32_acquire(READER_COUNT_OFFSET)
    }

    /// Returns the count before the increment.
    pub fn inc_readers(&self) -> Result<u32, CacheError> {
        self.region.fetch_add_u32(READER_COUNT_OFFSET, 1)
    }

    /// Returns the count before the decrement.
    pub fn dec_readers(&self) -> Result<u32, CacheError> {
        self.region.fetch_sub_u32(READER_COUNT_OFFSET, 1)
    }

    pub fn version(&self) -> Result<u32, CacheError> {
        self.region.load_u32_acquire(VERSION_OFFSET)
    }

    pub fn set_version(&self, version: u32) -> Result<(), CacheError> {
        self.region.store_u32_release(VERSION_OFFSET, version)
    }

    /// Reset all three words. Used when a file is (re)initialized.
    pub fn reset(&self) -> Result<(), CacheError> {
        self.set_rw_flag(RW_READABLE)?;
        self.region.store_u32_release(READER_COUNT_OFFSET, 0)?;
        self.set_version(0)
    }
}
