//! # pixels-cache — shared columnar-chunk cache for Pixels
//!
//! A single-host, multi-reader/single-writer store that keeps hot column
//! chunks ("columnlets") in a pre-allocated memory-mapped region so query
//! workers on the same host skip the distributed filesystem.
//!
//! Contract highlights (frozen in the on-disk layout):
//! - Both mapped files open with the 6-byte magic `"PIXELS"`
//! - The index file carries three atomic coordination words at fixed
//!   offsets: rw-flag (6), reader-count (8), version (12); the serialized
//!   radix root is always at offset 16
//! - Radix node fields and the 12-byte key/locator records are big-endian;
//!   child tables are sorted ascending by leader byte, so serialization is
//!   deterministic regardless of insertion order
//! - Child offsets point strictly forward; parsers reject anything else
//! - The cache file has no per-entry framing — framing lives in the index;
//!   locator offsets are relative to the data region at file offset 6
//! - Readers are wait-free and never surface errors: every failure is a
//!   miss, and the caller falls through to the distributed filesystem

pub mod error;
pub mod config;
pub mod region;
pub mod key;
pub mod layout;
pub mod radix;
pub mod writer;
pub mod reader;
pub mod bus;
pub mod source;
pub mod coordination;
pub mod daemon;

// Flat re-exports for the most common types.
pub use error::CacheError;
pub use config::CacheConfig;
pub use region::MappedRegion;
pub use key::{CacheIdx, CacheKey};
pub use radix::RadixTree;
pub use writer::{CacheWriter, WriteStatus, STATUS_FAILURE};
pub use reader::CacheReader;
pub use bus::{BusReader, BusRecord, MappedBus};
pub use source::{BlockSource, FileBlockSource, RowGroupFooter};
pub use coordination::{CachePlan, CoordinationStore, FileCoordinationStore};
pub use daemon::CacheDaemon;
