//! Serialized radix nodes — written by the writer, parsed in place by
//! readers and by [`reconstruct`].
//!
//! # On-disk node layout (root at index-file offset 16)
//!
//! ```text
//! Offset        Size  Field
//!    0             4  header    BE u32 = isKey<<31 | edgeSize<<9 | childCount
//!    4           N×8  children  BE u64 each = leader<<56 | childOffset
//!  4+N×8           E  edge      E = edgeSize bytes, leader byte included
//!  4+N×8+E   0 or 12  value     CacheIdx, present iff isKey
//! ```
//!
//! `childOffset` is an absolute byte offset into the index file and is
//! always strictly greater than the parent's offset — the serializer
//! allocates child offsets forward, so traversal can never loop. Parsers
//! reject any offset that points backwards or past the region end.
//!
//! # Serialization
//! One pass, pre-order. A running allocator assigns each child's offset
//! (ascending leader order) before the parent's child-table is written, and
//! [`node_len`] is the only sizing routine, so the allocator and the writer
//! cannot disagree about where a node lands.

use std::collections::HashSet;

use crate::error::CacheError;
use crate::key::{CacheIdx, CacheKey, IDX_LEN, KEY_LEN};
use crate::layout::{self, RADIX_OFFSET};
use crate::region::MappedRegion;

use super::{Node, RadixTree};

const HEADER_LEN:    usize = 4;
const CHILD_LEN:     usize = 8;
const IS_KEY_BIT:    u32   = 1 << 31;
const EDGE_SHIFT:    u32   = 9;
const EDGE_MAX:      u32   = (1 << 22) - 1;
const CHILD_MASK:    u32   = (1 << 9) - 1;
const LEADER_SHIFT:  u64   = 56;
const OFFSET_MASK:   u64   = (1 << LEADER_SHIFT) - 1;

/// Serialized size of one node.
fn node_len(child_count: usize, edge_len: usize, is_key: bool) -> usize {
    HEADER_LEN + CHILD_LEN * child_count + edge_len + if is_key { IDX_LEN } else { 0 }
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Write `root` and everything below it starting at `base`; returns the end
/// offset. Fails with `OutOfBounds` when the tree does not fit the region.
pub(super) fn serialize(
    root:   &Node,
    region: &MappedRegion,
    base:   usize,
) -> Result<usize, CacheError> {
    let mut alloc = base + node_len(root.children.len(), root.edge.len(), root.value.is_some());
    write_node(root, base, &mut alloc, region)?;
    Ok(alloc)
}

fn write_node(
    node:   &Node,
    offset: usize,
    alloc:  &mut usize,
    region: &MappedRegion,
) -> Result<(), CacheError> {
    debug_assert!(node.children.len() <= 256);
    debug_assert!((node.edge.len() as u32) <= EDGE_MAX);

    // Assign every child's offset before the table is written.
    let mut placed: Vec<(u8, usize, &Node)> = Vec::with_capacity(node.children.len());
    for (leader, child) in &node.children {
        placed.push((*leader, *alloc, child.as_ref()));
        *alloc += node_len(child.children.len(), child.edge.len(), child.value.is_some());
    }

    let header: u32 = (if node.value.is_some() { IS_KEY_BIT } else { 0 })
        | ((node.edge.len() as u32) << EDGE_SHIFT)
        | (node.children.len() as u32);
    region.put_bytes(offset, &header.to_be_bytes())?;

    let mut pos = offset + HEADER_LEN;
    for (leader, child_off, _) in &placed {
        let entry: u64 = ((*leader as u64) << LEADER_SHIFT) | (*child_off as u64 & OFFSET_MASK);
        region.put_bytes(pos, &entry.to_be_bytes())?;
        pos += CHILD_LEN;
    }
    region.put_bytes(pos, &node.edge)?;
    pos += node.edge.len();
    if let Some(value) = node.value {
        region.put_bytes(pos, &value.to_bytes())?;
    }

    for (_, child_off, child) in placed {
        write_node(child, child_off, alloc, region)?;
    }
    Ok(())
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Borrowed view of one serialized node.
pub struct NodeView<'a> {
    pub offset: usize,
    pub is_key: bool,
    children:   &'a [u8],
    pub edge:   &'a [u8],
    value:      Option<&'a [u8]>,
}

impl<'a> NodeView<'a> {
    pub fn child_count(&self) -> usize {
        self.children.len() / CHILD_LEN
    }

    /// `(leader, absolute child offset)` of the i-th child-table entry.
    pub fn child(&self, i: usize) -> (u8, u64) {
        let raw: [u8; 8] = self.children[i * CHILD_LEN..(i + 1) * CHILD_LEN]
            .try_into()
            .unwrap();
        let entry = u64::from_be_bytes(raw);
        ((entry >> LEADER_SHIFT) as u8, entry & OFFSET_MASK)
    }

    /// Linear search of the child table for `leader`.
    pub fn find_child(&self, leader: u8) -> Option<u64> {
        (0..self.child_count()).find_map(|i| {
            let (l, off) = self.child(i);
            (l == leader).then_some(off)
        })
    }

    pub fn value(&self) -> Option<CacheIdx> {
        self.value
            .map(|raw| CacheIdx::from_bytes(raw.try_into().unwrap()))
    }
}

/// Parse the node at `offset`, validating the header against the region
/// bounds. All failures are `CorruptIndex`.
pub fn parse_node(region: &MappedRegion, offset: usize) -> Result<NodeView<'_>, CacheError> {
    let header_raw = region
        .get_bytes(offset, HEADER_LEN)
        .map_err(|_| corrupt(offset, "node header out of range"))?;
    let header = u32::from_be_bytes(header_raw.try_into().unwrap());

    let is_key      = header & IS_KEY_BIT != 0;
    let edge_len    = ((header >> EDGE_SHIFT) & EDGE_MAX) as usize;
    let child_count = (header & CHILD_MASK) as usize;
    if child_count > 256 {
        return Err(corrupt(offset, "more than 256 children"));
    }

    let total = node_len(child_count, edge_len, is_key);
    let body = region
        .get_bytes(offset, total)
        .map_err(|_| corrupt(offset, "node body exceeds region"))?;

    let children_end = HEADER_LEN + CHILD_LEN * child_count;
    let edge_end = children_end + edge_len;
    Ok(NodeView {
        offset,
        is_key,
        children: &body[HEADER_LEN..children_end],
        edge:     &body[children_end..edge_end],
        value:    is_key.then(|| &body[edge_end..edge_end + IDX_LEN]),
    })
}

fn corrupt(offset: usize, what: &str) -> CacheError {
    CacheError::CorruptIndex(format!("node at offset {offset}: {what}"))
}

/// Validate a child offset against its parent before descending.
fn check_child_offset(parent: usize, child: u64, region_len: usize) -> Result<usize, CacheError> {
    if child <= parent as u64 || child >= region_len as u64 {
        return Err(corrupt(parent, "child offset not strictly forward"));
    }
    Ok(child as usize)
}

// ── Lookup (the reader's walk) ───────────────────────────────────────────────

/// Walk the serialized radix from the root at offset 16 without building a
/// tree. Returns the locator iff all 12 key bytes matched a key node.
pub fn lookup(region: &MappedRegion, key: CacheKey) -> Result<Option<CacheIdx>, CacheError> {
    let bytes = key.to_bytes();
    let mut node = parse_node(region, RADIX_OFFSET)?;

    // The root's edge is empty in practice; match it anyway so a foreign
    // but well-formed index parses identically everywhere.
    if !bytes.starts_with(node.edge) {
        return Ok(None);
    }
    let mut depth = node.edge.len();

    loop {
        if depth == KEY_LEN {
            return Ok(node.value());
        }
        let child_off = match node.find_child(bytes[depth]) {
            Some(off) => check_child_offset(node.offset, off, region.len())?,
            None => return Ok(None),
        };
        let child = parse_node(region, child_off)?;
        let edge = child.edge;
        if KEY_LEN - depth < edge.len() || &bytes[depth..depth + edge.len()] != edge {
            return Ok(None);
        }
        depth += edge.len();
        node = child;
    }
}

// ── Reconstruction ───────────────────────────────────────────────────────────

/// Rebuild an in-memory tree from the serialized layout. Used when the cache
/// files are reopened with `overwrite = false`.
pub(super) fn reconstruct(region: &MappedRegion) -> Result<RadixTree, CacheError> {
    if !layout::check_magic(region)? {
        return Err(CacheError::CorruptIndex("bad index magic".into()));
    }
    let mut visited = HashSet::new();
    let root = parse_subtree(region, RADIX_OFFSET, &mut visited)?;
    Ok(RadixTree::from_root(root))
}

fn parse_subtree(
    region:  &MappedRegion,
    offset:  usize,
    visited: &mut HashSet<usize>,
) -> Result<Node, CacheError> {
    if !visited.insert(offset) {
        return Err(corrupt(offset, "offset visited twice"));
    }
    let view = parse_node(region, offset)?;
    let edge = view.edge.to_vec();
    let value = view.value();

    let mut children = std::collections::BTreeMap::new();
    for i in 0..view.child_count() {
        let (leader, raw_off) = view.child(i);
        let child_off = check_child_offset(offset, raw_off, region.len())?;
        let child = parse_subtree(region, child_off, visited)?;
        if child.edge.first() != Some(&leader) {
            return Err(corrupt(child_off, "edge does not start with table leader"));
        }
        if children.insert(leader, Box::new(child)).is_some() {
            return Err(corrupt(offset, "duplicate leader in child table"));
        }
    }

    Ok(Node { edge, children, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::write_magic;
    use tempfile::TempDir;

    fn region(len: u64) -> (TempDir, MappedRegion) {
        let dir = TempDir::new().unwrap();
        let r = MappedRegion::new(dir.path().join("index"), len).unwrap();
        write_magic(&r).unwrap();
        (dir, r)
    }

    fn key(b: u64, rg: u16, c: u16) -> CacheKey {
        CacheKey::new(b, rg, c)
    }

    #[test]
    fn serialize_reconstruct_round_trip() {
        let (_d, r) = region(64 * 1024);
        let mut tree = RadixTree::new();
        for i in 0..500u16 {
            tree.put(key(i as u64 % 7, i, i.wrapping_mul(3)), CacheIdx::new(i as u64 * 16, 16));
        }
        tree.serialize(&r, RADIX_OFFSET).unwrap();

        let back = RadixTree::reconstruct(&r).unwrap();
        assert_eq!(back.len(), tree.len());
        for i in 0..500u16 {
            let k = key(i as u64 % 7, i, i.wrapping_mul(3));
            assert_eq!(back.get(k), tree.get(k));
            assert_eq!(lookup(&r, k).unwrap(), tree.get(k));
        }
        assert_eq!(lookup(&r, key(999, 0, 0)).unwrap(), None);
    }

    #[test]
    fn split_produces_shared_prefix_intermediate() {
        // Two keys differing only in the low column byte must serialize to
        // root -> intermediate (11-byte edge, not a key) -> two leaves whose
        // leaders differ at that byte.
        let (_d, r) = region(4096);
        let mut tree = RadixTree::new();
        tree.put(key(0x0102_0304_0506_0708, 0x090A, 0x0B03), CacheIdx::new(0, 1));
        tree.put(key(0x0102_0304_0506_0708, 0x090A, 0x0B05), CacheIdx::new(1, 1));
        tree.serialize(&r, RADIX_OFFSET).unwrap();

        let root = parse_node(&r, RADIX_OFFSET).unwrap();
        assert!(root.edge.is_empty());
        assert!(!root.is_key);
        assert_eq!(root.child_count(), 1);

        let (leader, mid_off) = root.child(0);
        assert_eq!(leader, 0x01);
        let mid = parse_node(&r, mid_off as usize).unwrap();
        assert_eq!(
            mid.edge,
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B]
        );
        assert!(!mid.is_key);
        assert_eq!(mid.child_count(), 2);
        assert_eq!(mid.child(0).0, 0x03);
        assert_eq!(mid.child(1).0, 0x05);

        let a = parse_node(&r, mid.child(0).1 as usize).unwrap();
        assert!(a.is_key);
        assert_eq!(a.value().unwrap(), CacheIdx::new(0, 1));
    }

    #[test]
    fn insertion_order_does_not_change_bytes() {
        let keys: Vec<(CacheKey, CacheIdx)> = (0..64u16)
            .map(|i| (key(i as u64 % 5, i / 3, i), CacheIdx::new(i as u64 * 8, 8)))
            .collect();

        let (_d1, r1) = region(16 * 1024);
        let mut t1 = RadixTree::new();
        for (k, v) in &keys {
            t1.put(*k, *v);
        }
        let end1 = t1.serialize(&r1, RADIX_OFFSET).unwrap();

        let (_d2, r2) = region(16 * 1024);
        let mut t2 = RadixTree::new();
        for (k, v) in keys.iter().rev() {
            t2.put(*k, *v);
        }
        let end2 = t2.serialize(&r2, RADIX_OFFSET).unwrap();

        assert_eq!(end1, end2);
        assert_eq!(
            r1.get_bytes(RADIX_OFFSET, end1 - RADIX_OFFSET).unwrap(),
            r2.get_bytes(RADIX_OFFSET, end2 - RADIX_OFFSET).unwrap()
        );
    }

    #[test]
    fn reconstruct_rejects_bad_magic_and_backward_offsets() {
        let (_d, r) = region(4096);
        let mut tree = RadixTree::new();
        tree.put(key(1, 2, 3), CacheIdx::new(0, 4));
        tree.serialize(&r, RADIX_OFFSET).unwrap();

        // Point the root's only child back at the root.
        let entry: u64 = ((0x00u64) << 56) | RADIX_OFFSET as u64;
        r.put_bytes(RADIX_OFFSET + 4, &entry.to_be_bytes()).unwrap();
        assert!(matches!(
            RadixTree::reconstruct(&r),
            Err(CacheError::CorruptIndex(_))
        ));

        r.put_bytes(0, b"NOTPIX").unwrap();
        assert!(matches!(
            RadixTree::reconstruct(&r),
            Err(CacheError::CorruptIndex(_))
        ));
    }

    #[test]
    fn serialize_fails_when_region_too_small() {
        let dir = TempDir::new().unwrap();
        let r = MappedRegion::new(dir.path().join("tiny"), 64).unwrap();
        write_magic(&r).unwrap();
        let mut tree = RadixTree::new();
        for i in 0..32u16 {
            tree.put(key(i as u64, i, i), CacheIdx::new(0, 1));
        }
        assert!(matches!(
            tree.serialize(&r, RADIX_OFFSET),
            Err(CacheError::OutOfBounds { .. })
        ));
    }
}
