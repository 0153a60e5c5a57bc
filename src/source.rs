//! External file reader seam — how the writer fetches columnlet bytes.
//!
//! The distributed-filesystem reader that actually decodes the columnar
//! format lives outside this crate. The writer only needs three things from
//! it: the block id of an opened file (the `blockId` component of every
//! cache key), per-row-group footers locating each column's chunk, and raw
//! byte reads. [`FileBlockSource`] is the local-file binding used by the
//! daemon binary and the tests; its footer is a flat JSON sidecar rather
//! than a real columnar footer.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Chunk locations for one row group: `column_id -> (offset, length)` within
/// the open block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowGroupFooter {
    pub chunks: HashMap<u16, (u64, u32)>,
}

impl RowGroupFooter {
    pub fn chunk(&self, column_id: u16) -> Option<(u64, u32)> {
        self.chunks.get(&column_id).copied()
    }
}

pub trait BlockSource {
    /// Open the file at `path`; returns the block id the filesystem assigned
    /// to the file's first block.
    fn open(&mut self, path: &str) -> Result<u64, CacheError>;

    /// Footer of one row group of the currently open block.
    fn row_group_footer(&mut self, row_group_id: u16) -> Result<RowGroupFooter, CacheError>;

    /// Raw bytes at `offset..offset+length` of the currently open block.
    fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>, CacheError>;

    /// Replace `path` with a host-local replica before reading. Invoked only
    /// when `enable.absolute.balancer` is set; the default keeps the path.
    fn localize(&mut self, path: &str) -> Result<String, CacheError> {
        Ok(path.to_owned())
    }
}

// ── Local-file binding ───────────────────────────────────────────────────────

/// Sidecar layout for [`FileBlockSource`]: `{path}.footer.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BlockFooter {
    pub block_id:   u64,
    /// `row_group_id -> footer`.
    pub row_groups: HashMap<u16, RowGroupFooter>,
}

/// Reads columnlets from plain local files with a JSON footer sidecar.
#[derive(Debug, Default)]
pub struct FileBlockSource {
    open:   Option<File>,
    footer: BlockFooter,
}

impl FileBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the sidecar for `path`. Test/tooling helper.
    pub fn write_footer<P: AsRef<Path>>(path: P, footer: &BlockFooter) -> Result<(), CacheError> {
        let raw = serde_json::to_vec_pretty(footer)
            .map_err(|e| CacheError::SourceIo(format!("footer encode: {e}")))?;
        std::fs::write(sidecar_path(path.as_ref()), raw)?;
        Ok(())
    }
}

fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".footer.json");
    std::path::PathBuf::from(s)
}

impl BlockSource for FileBlockSource {
    fn open(&mut self, path: &str) -> Result<u64, CacheError> {
        let file = File::open(path).map_err(|e| CacheError::SourceIo(format!("{path}: {e}")))?;
        let raw = std::fs::read(sidecar_path(Path::new(path)))
            .map_err(|e| CacheError::SourceIo(format!("{path} footer: {e}")))?;
        let footer: BlockFooter = serde_json::from_slice(&raw)
            .map_err(|e| CacheError::SourceIo(format!("{path} footer: {e}")))?;
        self.open = Some(file);
        let block_id = footer.block_id;
        self.footer = footer;
        Ok(block_id)
    }

    fn row_group_footer(&mut self, row_group_id: u16) -> Result<RowGroupFooter, CacheError> {
        self.footer
            .row_groups
            .get(&row_group_id)
            .cloned()
            .ok_or_else(|| CacheError::SourceIo(format!("no footer for row group {row_group_id}")))
    }

    fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>, CacheError> {
        let file = self
            .open
            .as_mut()
            .ok_or_else(|| CacheError::SourceIo("no block open".into()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CacheError::SourceIo(e.to_string()))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .map_err(|e| CacheError::SourceIo(e.to_string()))?;
        Ok(buf)
    }
}
