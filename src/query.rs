//! Cursor over a materialized query result.
//!
//! Walks a list of point entries and projects each record into a
//! caller-supplied buffer. Entries own their bytes, so the cursor stays
//! valid while the tree keeps mutating.

use crate::error::{PointError, Result};
use crate::schema::Schema;
use crate::tree::PointEntry;

pub struct ReadQuery {
    entries: Vec<PointEntry>,
    index: usize,
}

impl ReadQuery {
    pub fn new(entries: Vec<PointEntry>) -> Self {
        Self { entries, index: 0 }
    }

    /// Total points addressable by this cursor.
    pub fn num_points(&self) -> usize {
        self.entries.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn eof(&self) -> bool {
        self.index == self.entries.len()
    }

    /// Copy the current record into `dst` in schema field order and
    /// advance the cursor.
    ///
    /// `rasterize` is carried for call compatibility with the session
    /// protocol; raster output formatting is not defined by it.
    pub fn read_point(&mut self, dst: &mut [u8], schema: &Schema, _rasterize: bool) -> Result<()> {
        if self.eof() {
            return Err(PointError::ShortRead {
                wanted: schema.point_size(),
                remaining: 0,
            });
        }
        let stride = schema.point_size();
        dst[..stride].copy_from_slice(&self.entries[self.index].bytes[..stride]);
        self.index += 1;
        Ok(())
    }

    /// Drain the remaining points into one contiguous buffer.
    pub fn read_all(&mut self, schema: &Schema) -> Result<Vec<u8>> {
        let stride = schema.point_size();
        let remaining = self.entries.len() - self.index;
        let mut out = vec![0u8; remaining * stride];
        for chunk in out.chunks_exact_mut(stride) {
            self.read_point(chunk, schema, false)?;
        }
        Ok(out)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
