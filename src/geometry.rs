//! Planar geometry for XY partitioning.
//!
//! The tree indexes points by their XY coordinate only; Z and every other
//! dimension ride along as record payload.

use serde::{Deserialize, Serialize};

// ── Point ──────────────────────────────────────────────────────────

/// Planar coordinate used as the index key of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// ── Quadrant ───────────────────────────────────────────────────────

/// Child position within a split cell. The discriminant doubles as the
/// child array index and the on-page ordering (NW, NE, SW, SE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Quadrant {
    Nw = 0,
    Ne = 1,
    Sw = 2,
    Se = 3,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [Quadrant::Nw, Quadrant::Ne, Quadrant::Sw, Quadrant::Se];

    pub fn index(self) -> usize {
        self as usize
    }
}

// ── BBox ───────────────────────────────────────────────────────────

/// Closed rectangle [x_min, x_max] × [y_min, y_max].
///
/// On the wire (the `read` command's `bbox` parameter) a box is the
/// four-element array `[xMin, yMin, xMax, yMax]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl From<[f64; 4]> for BBox {
    fn from([x_min, y_min, x_max, y_max]: [f64; 4]) -> Self {
        BBox::new(x_min, y_min, x_max, y_max)
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x_min, b.y_min, b.x_max, b.y_max]
    }
}

impl BBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Containment is inclusive on all four edges.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x_min && p.x <= self.x_max && p.y >= self.y_min && p.y <= self.y_max
    }

    /// Rectangles that merely touch along an edge intersect.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.x_min <= other.x_max
            && self.x_max >= other.x_min
            && self.y_min <= other.y_max
            && self.y_max >= other.y_min
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Midpoint shared by all four quadrants of a split. Computed once
    /// per split and reused so the shared edges are bit-identical.
    pub fn mid(&self) -> Point {
        Point::new(
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Split into four equal-area quadrants, ordered NW, NE, SW, SE.
    ///
    /// The midpoint lines belong to the upper-x / upper-y quadrants; see
    /// [`BBox::quadrant_of`] for the matching point assignment.
    pub fn split(&self) -> [BBox; 4] {
        let m = self.mid();
        [
            BBox::new(self.x_min, m.y, m.x, self.y_max), // NW
            BBox::new(m.x, m.y, self.x_max, self.y_max), // NE
            BBox::new(self.x_min, self.y_min, m.x, m.y), // SW
            BBox::new(m.x, self.y_min, self.x_max, m.y), // SE
        ]
    }

    /// Quadrant a contained point routes into. A point exactly on the
    /// split line goes to the upper-x / upper-y side. No tolerance.
    pub fn quadrant_of(&self, p: Point) -> Quadrant {
        let m = self.mid();
        let east = p.x >= m.x;
        let north = p.y >= m.y;
        match (east, north) {
            (false, true) => Quadrant::Nw,
            (true, true) => Quadrant::Ne,
            (false, false) => Quadrant::Sw,
            (true, false) => Quadrant::Se,
        }
    }

    /// Bounding box of one quadrant, without allocating all four.
    pub fn quadrant_bbox(&self, q: Quadrant) -> BBox {
        self.split()[q.index()]
    }
}

// ── Tests ──────────────────────────────────────────────────────────
