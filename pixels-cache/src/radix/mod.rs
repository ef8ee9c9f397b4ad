//! In-memory radix over 12-byte cache keys, with serialization into and
//! reconstruction from the mapped index file.
//!
//! The on-disk layout is the canonical contract (readers in other
//! processes parse it in place, see `reader`): the root node sits at
//! offset 16; each node is `header u32 | child table | edge bytes |
//! optional 12-byte value`, all big-endian, with absolute child offsets
//! allocated strictly forward of the parent.

mod key;
mod node;
mod value;

pub use key::{CacheKey, CACHE_KEY_LEN};
pub use node::RadixNode;
pub use value::{CacheIdx, CACHE_IDX_LEN};

pub(crate) use node::{decode_child, encode_child, NodeHeader, NODE_CHILD_LEN, NODE_HEADER_LEN};

use crate::error::{Error, Result};
use crate::header::{check_magic, INDEX_RADIX_OFFSET};
use crate::mem::MappedRegion;
use std::collections::HashSet;

/// Edge-labelled trie keyed by the big-endian serialization of
/// [`CacheKey`], valued by [`CacheIdx`] locators.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Radix {
    root: RadixNode,
}

impl Radix {
    #[inline]
    pub fn new() -> Self {
        Radix::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.value.is_none()
    }

    /// Insert or overwrite the locator of `key`.
    pub fn put(&mut self, key: CacheKey, value: CacheIdx) {
        let bytes = key.to_bytes();
        let mut node = &mut self.root;
        let mut pos = 0usize;
        loop {
            if pos == bytes.len() {
                node.value = Some(value);
                return;
            }
            let leader = bytes[pos];
            if !node.children.contains_key(&leader) {
                let mut leaf = RadixNode::with_edge(bytes[pos..].to_vec());
                leaf.value = Some(value);
                node.children.insert(leader, leaf);
                return;
            }
            let child = node.children.get_mut(&leader).unwrap();
            let rest = &bytes[pos..];
            let lcp = common_prefix(&child.edge, rest);
            if lcp == child.edge.len() {
                // full edge matched, descend.
                pos += lcp;
                node = child;
                continue;
            }
            // patricia split: replace the child with an intermediate node
            // labelled by the common prefix, re-hang the old child under
            // its remaining edge and attach the new key next to it.
            let prefix = child.edge[..lcp].to_vec();
            let mut old = std::mem::replace(child, RadixNode::with_edge(prefix));
            old.edge.drain(..lcp);
            child.children.insert(old.edge[0], old);
            if lcp == rest.len() {
                child.value = Some(value);
            } else {
                let mut leaf = RadixNode::with_edge(rest[lcp..].to_vec());
                leaf.value = Some(value);
                child.children.insert(rest[lcp], leaf);
            }
            return;
        }
    }

    /// Follow edges matching the key bytes; the terminal node must be a key
    /// and all 12 bytes must have matched.
    pub fn get(&self, key: CacheKey) -> Option<CacheIdx> {
        let bytes = key.to_bytes();
        let mut node = &self.root;
        let mut pos = 0usize;
        loop {
            if pos == bytes.len() {
                return node.value;
            }
            let child = node.children.get(&bytes[pos])?;
            if bytes.len() - pos < child.edge.len() || bytes[pos..pos + child.edge.len()] != child.edge[..]
            {
                return None;
            }
            pos += child.edge.len();
            node = child;
        }
    }

    /// Reset to an empty root.
    #[inline]
    pub fn remove_all(&mut self) {
        self.root = RadixNode::default();
    }

    /// All `(key, locator)` pairs reachable from the root, in key order.
    pub fn entries(&self) -> Vec<(CacheKey, CacheIdx)> {
        fn visit(node: &RadixNode, path: &mut Vec<u8>, out: &mut Vec<(CacheKey, CacheIdx)>) {
            path.extend_from_slice(&node.edge);
            if let Some(value) = node.value {
                if path.len() == CACHE_KEY_LEN {
                    out.push((CacheKey::from_bytes(path[..].try_into().unwrap()), value));
                }
            }
            for child in node.children.values() {
                visit(child, path, out);
            }
            path.truncate(path.len() - node.edge.len());
        }
        let mut out = Vec::new();
        let mut path = Vec::with_capacity(CACHE_KEY_LEN);
        visit(&self.root, &mut path, &mut out);
        out
    }

    /// Depth-first pre-order write of the tree into the index region,
    /// root at offset 16. Child offsets are taken from a forward-only
    /// allocation cursor while the parent's child table is written, so the
    /// sizing pass ([`RadixNode::length_in_bytes`]) and the write pass can
    /// never disagree. Children are emitted in ascending leader-byte order.
    ///
    /// Returns the offset one past the last serialized byte.
    pub fn serialize(&self, region: &MappedRegion) -> Result<usize> {
        let mut allocated = INDEX_RADIX_OFFSET + self.root.length_in_bytes();
        Self::write_node(region, &self.root, INDEX_RADIX_OFFSET, &mut allocated)?;
        Ok(allocated)
    }

    fn write_node(
        region: &MappedRegion,
        node: &RadixNode,
        offset: usize,
        allocated: &mut usize,
    ) -> Result<()> {
        let header = NodeHeader {
            is_key: node.is_key(),
            edge_len: node.edge.len(),
            child_count: node.children.len(),
        };
        region.put_bytes(offset, &header.encode().to_be_bytes())?;
        let mut pos = offset + NODE_HEADER_LEN;
        let mut child_offsets = Vec::with_capacity(node.children.len());
        for (&leader, child) in &node.children {
            let child_offset = *allocated;
            *allocated += child.length_in_bytes();
            region.put_bytes(pos, &encode_child(leader, child_offset as u64).to_be_bytes())?;
            pos += NODE_CHILD_LEN;
            child_offsets.push(child_offset);
        }
        region.put_bytes(pos, &node.edge)?;
        pos += node.edge.len();
        if let Some(value) = node.value {
            region.put_bytes(pos, &value.to_bytes())?;
        }
        for (child, child_offset) in node.children.values().zip(child_offsets) {
            Self::write_node(region, child, child_offset, allocated)?;
        }
        Ok(())
    }

    /// Parse a serialized radix out of the index region, validating magic,
    /// header plausibility, strictly-forward child offsets and that no
    /// offset is visited twice.
    pub fn reconstruct(region: &MappedRegion) -> Result<Radix> {
        if !check_magic(region)? {
            return Err(Error::CorruptIndex("bad magic"));
        }
        let mut visited = HashSet::new();
        visited.insert(INDEX_RADIX_OFFSET);
        let root = Self::parse_node(region, INDEX_RADIX_OFFSET, &mut visited)?;
        if !root.edge.is_empty() {
            return Err(Error::CorruptIndex("root node has a non-empty edge"));
        }
        Ok(Radix { root })
    }

    fn parse_node(
        region: &MappedRegion,
        offset: usize,
        visited: &mut HashSet<usize>,
    ) -> Result<RadixNode> {
        let raw = region
            .get_bytes(offset, NODE_HEADER_LEN)
            .map_err(|_| Error::CorruptIndex("node header out of range"))?;
        let header = NodeHeader::decode(u32::from_be_bytes(raw.try_into().unwrap()));
        if offset + header.node_len() > region.size() {
            return Err(Error::CorruptIndex("node exceeds index region"));
        }
        let mut node = RadixNode::default();
        let mut pos = offset + NODE_HEADER_LEN;
        let mut children = Vec::with_capacity(header.child_count);
        for _ in 0..header.child_count {
            let entry = region.get_bytes(pos, NODE_CHILD_LEN)?;
            children.push(decode_child(u64::from_be_bytes(entry.try_into().unwrap())));
            pos += NODE_CHILD_LEN;
        }
        node.edge = region.get_bytes(pos, header.edge_len)?.to_vec();
        pos += header.edge_len;
        if header.is_key {
            let raw = region.get_bytes(pos, CACHE_IDX_LEN)?;
            node.value = Some(CacheIdx::from_bytes(raw.try_into().unwrap()));
        }
        for (leader, child_offset) in children {
            let child_offset = child_offset as usize;
            if child_offset <= offset {
                return Err(Error::CorruptIndex("child offset not strictly forward"));
            }
            if child_offset >= region.size() {
                return Err(Error::CorruptIndex("child offset out of range"));
            }
            if !visited.insert(child_offset) {
                return Err(Error::CorruptIndex("node offset visited twice"));
            }
            let child = Self::parse_node(region, child_offset, visited)?;
            if child.edge.first() != Some(&leader) {
                return Err(Error::CorruptIndex("child edge does not start with leader"));
            }
            if node.children.insert(leader, child).is_some() {
                return Err(Error::CorruptIndex("duplicate child leader"));
            }
        }
        Ok(node)
    }
}

#[inline]
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
