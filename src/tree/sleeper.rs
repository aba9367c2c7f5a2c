//! The quadtree proper.
//!
//! Writers claim base-page slots by CAS or descend; readers traverse
//! without locks and only ever observe fully published records. There is
//! no global tree lock.

use std::sync::Arc;

use crate::geometry::{BBox, Point, Quadrant};
use crate::schema::{DimId, Schema};
use crate::tree::node::Node;
use crate::tree::page::BasePage;

/// One query result: the index key plus an owned copy of the record
/// bytes. Results are materialized immediately so they stay valid while
/// the tree keeps mutating.
#[derive(Debug, Clone, PartialEq)]
pub struct PointEntry {
    pub point: Point,
    pub bytes: Vec<u8>,
}

// ── Sleeper ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Sleeper {
    bbox: BBox,
    base_depth: usize,
    schema: Arc<Schema>,
    x_dim: DimId,
    y_dim: DimId,
    page: BasePage,
    root: Node,
}

impl Sleeper {
    pub fn new(bbox: BBox, schema: Arc<Schema>, base_depth: usize) -> Self {
        let page = BasePage::new(schema.point_size(), base_depth);
        Self::with_page(bbox, schema, base_depth, page)
    }

    /// Awaken a sleeper from a restored base page.
    pub fn with_page(bbox: BBox, schema: Arc<Schema>, base_depth: usize, page: BasePage) -> Self {
        let x_dim = schema.find("X").expect("schema defines X");
        let y_dim = schema.find("Y").expect("schema defines Y");
        let root = Node::root(bbox, base_depth);
        Self {
            bbox,
            base_depth,
            schema,
            x_dim,
            y_dim,
            page,
            root,
        }
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn base_depth(&self) -> usize {
        self.base_depth
    }

    pub fn page(&self) -> &BasePage {
        &self.page
    }

    fn stride(&self) -> usize {
        self.schema.point_size()
    }

    fn point_of(&self, record: &[u8]) -> Point {
        Point::new(
            self.schema.field_f64(record, self.x_dim),
            self.schema.field_f64(record, self.y_dim),
        )
    }

    /// Total records sitting in overflow lists past the base band.
    /// These are the records a base-page snapshot does not cover.
    pub fn overflow_count(&self) -> u64 {
        let mut count = 0u64;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            count += node.overflow_len(self.stride()) as u64;
            for q in Quadrant::ALL {
                if let Some(child) = node.child(q) {
                    stack.push(child);
                }
            }
        }
        count
    }

    // ── Insertion ──────────────────────────────────────────────────

    /// Route one packed record into the tree. Returns false when the
    /// point lies outside the root bounds (dropped, not an error).
    pub fn add_point(&self, point: Point, record: &[u8]) -> bool {
        debug_assert_eq!(record.len(), self.stride());
        if !self.bbox.contains(point) {
            return false;
        }

        let mut node = &self.root;
        loop {
            match node.slot() {
                Some(slot) => {
                    if self.page.try_claim(slot) {
                        self.page.commit(slot, record);
                        return true;
                    }
                    // Slot already won by an earlier point; descend.
                    let q = node.bbox().quadrant_of(point);
                    node = node.child_or_create(q, self.base_depth);
                }
                None => {
                    node.push_overflow(record);
                    return true;
                }
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Points of every node with `depth_begin <= depth < depth_end`,
    /// emitted depth-ascending and NW/NE/SW/SE within each depth.
    pub fn get_points(&self, depth_begin: u64, depth_end: u64) -> Vec<PointEntry> {
        self.collect(None, depth_begin, depth_end)
    }

    /// Like [`Sleeper::get_points`] but pruned to `query`: subtrees whose
    /// bounds miss the box are skipped, candidates are filtered by
    /// inclusive containment.
    pub fn get_points_in(&self, query: &BBox, depth_begin: u64, depth_end: u64) -> Vec<PointEntry> {
        self.collect(Some(query), depth_begin, depth_end)
    }

    fn collect(&self, query: Option<&BBox>, depth_begin: u64, depth_end: u64) -> Vec<PointEntry> {
        // The deepest node is the overflow boundary at base_depth.
        let end = depth_end.min(self.base_depth as u64 + 1);
        if depth_begin >= end {
            return Vec::new();
        }
        let begin = depth_begin as usize;
        let end = end as usize;

        let mut buckets: Vec<Vec<PointEntry>> = vec![Vec::new(); end - begin];
        self.visit(&self.root, query, begin, end, &mut buckets);
        buckets.into_iter().flatten().collect()
    }

    fn visit(
        &self,
        node: &Node,
        query: Option<&BBox>,
        begin: usize,
        end: usize,
        buckets: &mut [Vec<PointEntry>],
    ) {
        if node.depth() >= end {
            return;
        }
        if let Some(q) = query {
            if !node.bbox().intersects(q) {
                return;
            }
        }

        if node.depth() >= begin {
            let bucket = node.depth() - begin;
            match node.slot() {
                Some(slot) => {
                    if let Some(record) = self.page.read(slot) {
                        let point = self.point_of(record);
                        if query.map_or(true, |q| q.contains(point)) {
                            buckets[bucket].push(PointEntry {
                                point,
                                bytes: record.to_vec(),
                            });
                        }
                    }
                }
                None => {
                    // Overflow preserves insertion order.
                    for bytes in node.overflow_records(self.stride()) {
                        let point = self.point_of(&bytes);
                        if query.map_or(true, |q| q.contains(point)) {
                            buckets[bucket].push(PointEntry { point, bytes });
                        }
                    }
                }
            }
        }

        for q4 in Quadrant::ALL {
            if let Some(child) = node.child(q4) {
                self.visit(child, query, begin, end, buckets);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
