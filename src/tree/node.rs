//! Quadtree cell.
//!
//! Nodes inside the base band own a slot in the shared base page; the
//! single node at the base boundary holds an unbounded overflow list
//! instead and the tree never grows past it. Children are created
//! lazily; the `OnceLock` cell doubles as the per-parent latch for
//! double-checked creation, so readers walk child pointers without
//! taking any lock.

use std::sync::{Mutex, OnceLock};

use crate::geometry::{BBox, Quadrant};
use crate::tree::page::level_offset;

#[derive(Debug)]
pub struct Node {
    bbox: BBox,
    depth: usize,
    /// Index of this node within its level, in quadrant-major order.
    path: usize,
    /// Absolute base-page slot; None at or below the base boundary.
    slot: Option<usize>,
    children: [OnceLock<Box<Node>>; 4],
    /// Packed overflow records, only at `depth == base_depth`.
    overflow: Option<Mutex<Vec<u8>>>,
}

impl Node {
    pub fn new(bbox: BBox, depth: usize, path: usize, base_depth: usize) -> Self {
        let slot = (depth < base_depth).then(|| level_offset(depth) + path);
        let overflow = (depth >= base_depth).then(|| Mutex::new(Vec::new()));
        Self {
            bbox,
            depth,
            path,
            slot,
            children: Default::default(),
            overflow,
        }
    }

    pub fn root(bbox: BBox, base_depth: usize) -> Self {
        Self::new(bbox, 0, 0, base_depth)
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Existing child, if any. Lock-free.
    pub fn child(&self, q: Quadrant) -> Option<&Node> {
        self.children[q.index()].get().map(|b| b.as_ref())
    }

    /// Child for the quadrant, created on first use.
    pub fn child_or_create(&self, q: Quadrant, base_depth: usize) -> &Node {
        self.children[q.index()].get_or_init(|| {
            Box::new(Node::new(
                self.bbox.quadrant_bbox(q),
                self.depth + 1,
                self.path * 4 + q.index(),
                base_depth,
            ))
        })
    }

    /// Append a packed record to the overflow list. Only valid at the
    /// base boundary.
    pub fn push_overflow(&self, record: &[u8]) {
        let overflow = self
            .overflow
            .as_ref()
            .expect("overflow append on a base-band node");
        overflow.lock().unwrap().extend_from_slice(record);
    }

    /// Copy of the overflow records in insertion order.
    pub fn overflow_records(&self, stride: usize) -> Vec<Vec<u8>> {
        match &self.overflow {
            Some(overflow) => {
                let data = overflow.lock().unwrap();
                data.chunks_exact(stride).map(|c| c.to_vec()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of records currently in the overflow list.
    pub fn overflow_len(&self, stride: usize) -> usize {
        match &self.overflow {
            Some(overflow) => overflow.lock().unwrap().len() / stride,
            None => 0,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
