//! Error kinds shared across the cache.
//!
//! Reader-facing note: [`crate::reader::CacheReader`] never surfaces these to
//! its caller — every failure on the lookup path degrades to a miss and the
//! caller falls through to the distributed filesystem. Errors propagate only
//! on the writer/daemon side, where the orchestrator consumes numeric status
//! codes (see [`crate::writer::WriteStatus`]).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// An access at `offset..offset+len` falls outside the mapped region.
    #[error("region access out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// The region was unmapped; no further operations are possible.
    #[error("mapped region is closed")]
    ClosedRegion,

    /// The serialized index failed validation: bad magic, impossible header,
    /// child offset out of range, or a revisited node offset.
    #[error("corrupt cache index: {0}")]
    CorruptIndex(String),

    /// A columnlet does not fit in the remaining cache-file data region.
    /// The writer converts this into a committed partial rebuild.
    #[error("cache capacity exceeded: need {need} bytes, {remaining} remain")]
    CapacityExceeded { need: u64, remaining: u64 },

    /// The bus `limit` word moved past the end of the bus file. The bus
    /// stays closed until it is recreated.
    #[error("mapped bus is full")]
    EndOfBus,

    /// The coordination store refused, lost the lease, or has no key for us.
    /// The daemon treats this as "nothing to do".
    #[error("coordination failure: {0}")]
    CoordinationFailure(String),

    /// The external block reader failed while fetching columnlet bytes.
    /// The rebuild aborts and leaves the cache in the `writing` state.
    #[error("columnlet source failure: {0}")]
    SourceIo(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
