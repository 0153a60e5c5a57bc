//! Radix index — an edge-labelled trie over 12-byte cache keys.
//!
//! The in-memory tree is the writer's working structure; the serialized form
//! in the index file (see [`disk`]) is the canonical contract, parsed in
//! place by readers. Edges carry their leader byte, children are keyed by
//! that leader in a `BTreeMap`, so iteration — and therefore serialization —
//! is deterministic in ascending leader order regardless of insertion order.
//!
//! Keys are fixed-length (12 bytes), so no key is ever a proper prefix of
//! another; interior nodes created by edge splits never carry values.

pub mod disk;

use std::collections::BTreeMap;

use crate::error::CacheError;
use crate::key::{CacheIdx, CacheKey};
use crate::region::MappedRegion;

#[derive(Debug, Default)]
pub(crate) struct Node {
    /// Byte string labelling the incoming edge, leader byte included.
    /// Empty only at the root.
    pub(crate) edge:     Vec<u8>,
    pub(crate) children: BTreeMap<u8, Box<Node>>,
    /// Present iff this node terminates a key.
    pub(crate) value:    Option<CacheIdx>,
}

impl Node {
    fn key_count(&self) -> usize {
        self.value.is_some() as usize
            + self.children.values().map(|c| c.key_count()).sum::<usize>()
    }
}

#[derive(Debug, Default)]
pub struct RadixTree {
    root: Node,
    len:  usize,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl RadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_root(root: Node) -> Self {
        let len = root.key_count();
        Self { root, len }
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Insert or overwrite. Splits an edge when the existing edge shares
    /// only a proper prefix with the remaining key bytes.
    pub fn put(&mut self, key: CacheKey, value: CacheIdx) {
        if Self::insert_below(&mut self.root, &key.to_bytes(), value) {
            self.len += 1;
        }
    }

    /// Returns true when a new key was created (false on overwrite).
    fn insert_below(node: &mut Node, rest: &[u8], value: CacheIdx) -> bool {
        if rest.is_empty() {
            let fresh = node.value.is_none();
            node.value = Some(value);
            return fresh;
        }
        match node.children.get_mut(&rest[0]) {
            None => {
                node.children.insert(
                    rest[0],
                    Box::new(Node {
                        edge:     rest.to_vec(),
                        children: BTreeMap::new(),
                        value:    Some(value),
                    }),
                );
                true
            }
            Some(child) => {
                let common = common_prefix(&child.edge, rest);
                if common == child.edge.len() {
                    return Self::insert_below(child.as_mut(), &rest[common..], value);
                }
                // Patricia split: replace `child` with an intermediate node
                // labelled by the shared prefix; the old node keeps its
                // suffix, the new key becomes a sibling leaf (or the
                // intermediate node itself when the key ends at the split).
                let mut old = std::mem::take(child.as_mut());
                let suffix = old.edge.split_off(common);
                let prefix = std::mem::take(&mut old.edge);
                old.edge = suffix;

                let mut mid = Node {
                    edge:     prefix,
                    children: BTreeMap::new(),
                    value:    None,
                };
                mid.children.insert(old.edge[0], Box::new(old));
                if rest.len() == common {
                    mid.value = Some(value);
                } else {
                    mid.children.insert(
                        rest[common],
                        Box::new(Node {
                            edge:     rest[common..].to_vec(),
                            children: BTreeMap::new(),
                            value:    Some(value),
                        }),
                    );
                }
                **child = mid;
                true
            }
        }
    }

    /// Follow edges matching the key bytes; hit iff all 12 bytes matched and
    /// the terminal node carries a value.
    pub fn get(&self, key: CacheKey) -> Option<CacheIdx> {
        let bytes = key.to_bytes();
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            if depth == bytes.len() {
                return node.value;
            }
            let child = node.children.get(&bytes[depth])?;
            let edge = child.edge.as_slice();
            if bytes.len() - depth < edge.len() || &bytes[depth..depth + edge.len()] != edge {
                return None;
            }
            depth += edge.len();
            node = child.as_ref();
        }
    }

    /// Reset to an empty root.
    pub fn remove_all(&mut self) {
        self.root = Node::default();
        self.len = 0;
    }

    /// Depth-first pre-order write into `region` starting at `base`.
    /// Returns the end offset of the serialized tree.
    pub fn serialize(&self, region: &MappedRegion, base: usize) -> Result<usize, CacheError> {
        disk::serialize(&self.root, region, base)
    }

    /// Parse the serialized layout back into an in-memory tree, validating
    /// magic, headers, and offset monotonicity along the way.
    pub fn reconstruct(region: &MappedRegion) -> Result<Self, CacheError> {
        disk::reconstruct(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u64, rg: u16, c: u16) -> CacheKey {
        CacheKey::new(b, rg, c)
    }

    fn idx(off: u64, len: u32) -> CacheIdx {
        CacheIdx::new(off, len)
    }

    #[test]
    fn put_get_overwrite() {
        let mut t = RadixTree::new();
        assert_eq!(t.get(key(1, 2, 3)), None);

        t.put(key(1, 2, 3), idx(0, 10));
        t.put(key(1, 2, 4), idx(10, 20));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(key(1, 2, 3)), Some(idx(0, 10)));
        assert_eq!(t.get(key(1, 2, 4)), Some(idx(10, 20)));

        t.put(key(1, 2, 3), idx(99, 1));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(key(1, 2, 3)), Some(idx(99, 1)));
    }

    #[test]
    fn split_creates_shared_prefix_node() {
        // Keys diverging in the last byte share an 11-byte prefix; the split
        // must leave both reachable and nothing else.
        let mut t = RadixTree::new();
        t.put(key(42, 3, 5), idx(0, 1));
        t.put(key(42, 3, 7), idx(1, 1));
        t.put(key(42, 4, 5), idx(2, 1));

        assert_eq!(t.get(key(42, 3, 5)), Some(idx(0, 1)));
        assert_eq!(t.get(key(42, 3, 7)), Some(idx(1, 1)));
        assert_eq!(t.get(key(42, 4, 5)), Some(idx(2, 1)));
        assert_eq!(t.get(key(42, 3, 6)), None);
        assert_eq!(t.get(key(42, 4, 7)), None);
    }

    #[test]
    fn remove_all_resets() {
        let mut t = RadixTree::new();
        for i in 0..100u16 {
            t.put(key(7, i, i), idx(i as u64, 8));
        }
        assert_eq!(t.len(), 100);
        t.remove_all();
        assert_eq!(t.len(), 0);
        assert_eq!(t.get(key(7, 0, 0)), None);
    }
}
