//! The sleepy tree: an out-of-core quadtree point store.
//!
//! `SleepyTree` is the session-facing façade. It owns the point context,
//! assigns origin tags, packs incoming rows, and routes them into the
//! `Sleeper`. Persistence is a framed little-endian file whose payload is
//! the LAZ-compressed base page:
//!
//! ```text
//! [xMin:f64][yMin:f64][xMax:f64][yMax:f64]
//! [uncompressedSize:u64][compressedSize:u64]
//! [compressedBytes]
//! ```
//!
//! Multi-byte values are little-endian on disk regardless of host order.
//! Only the base page is persisted; overflow lists are not serialized.

pub mod node;
pub mod page;
pub mod sleeper;

pub use page::{page_capacity, BasePage};
pub use sleeper::{PointEntry, Sleeper};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{PointError, Result};
use crate::geometry::{BBox, Point};
use crate::http::s3::S3;
use crate::schema::{DimId, DimType, Schema, ORIGIN_DIM};
use crate::source::SourceBuffer;
use crate::stream;

/// Depth of the base band. Slots for depths `0..BASE_DEPTH` total
/// (4^11 - 1) / 3 = 1,398,101, about 1<<20 points of dense capacity.
pub const BASE_DEPTH: usize = 11;

/// Framed header: four f64 bounds plus two u64 sizes.
pub const FILE_HEADER_SIZE: usize = 48;

/// On-disk location of a serialized tree under the serial root.
pub fn serial_path(root: &Path, pipeline_id: &str) -> PathBuf {
    root.join(pipeline_id).join("0")
}

// ── SleepyTree ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SleepyTree {
    pipeline_id: String,
    bbox: BBox,
    schema: Arc<Schema>,
    origin_dim: DimId,
    num_points: AtomicU64,
    sleeper: Sleeper,
}

impl SleepyTree {
    /// Create an empty tree over `bbox`. The reserved `OriginId`
    /// dimension is assigned on top of the supplied schema if absent.
    pub fn new(pipeline_id: &str, bbox: BBox, schema: Schema) -> Result<Self> {
        Self::with_base_depth(pipeline_id, bbox, schema, BASE_DEPTH)
    }

    /// Like [`SleepyTree::new`] with an explicit base band depth.
    pub fn with_base_depth(
        pipeline_id: &str,
        bbox: BBox,
        schema: Schema,
        base_depth: usize,
    ) -> Result<Self> {
        let (schema, origin_dim) = Self::prepare_schema(schema)?;
        let sleeper = Sleeper::new(bbox, Arc::clone(&schema), base_depth);
        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            bbox,
            schema,
            origin_dim,
            num_points: AtomicU64::new(0),
            sleeper,
        })
    }

    fn prepare_schema(mut schema: Schema) -> Result<(Arc<Schema>, DimId)> {
        if schema.find("X").is_none() || schema.find("Y").is_none() {
            return Err(PointError::InvalidPipeline(
                "point schema must define X and Y".to_string(),
            ));
        }
        let origin_dim = match schema.find(ORIGIN_DIM) {
            Some(id) => id,
            None => schema.assign(ORIGIN_DIM, DimType::U64)?,
        };
        Ok((Arc::new(schema), origin_dim))
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn origin_dim(&self) -> DimId {
        self.origin_dim
    }

    /// Points accepted so far (out-of-bounds drops excluded).
    pub fn num_points(&self) -> u64 {
        self.num_points.load(Ordering::Relaxed)
    }

    /// Records held in overflow lists past the base band. Persistence
    /// does not cover these; see [`SleepyTree::serialize`].
    pub fn overflow_count(&self) -> u64 {
        self.sleeper.overflow_count()
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Pack and route every in-bounds row of the source, tagging each
    /// record with `origin`. Returns the number of accepted points.
    /// Out-of-bounds rows are silently dropped.
    pub fn insert(&self, source: &SourceBuffer, origin: u64) -> Result<u64> {
        let src_schema = source.schema();
        let sx = src_schema.find("X").ok_or_else(|| {
            PointError::InvalidPipeline("source buffer has no X dimension".to_string())
        })?;
        let sy = src_schema.find("Y").ok_or_else(|| {
            PointError::InvalidPipeline("source buffer has no Y dimension".to_string())
        })?;

        let mut scratch = vec![0u8; self.schema.point_size()];
        let mut accepted = 0u64;

        for i in 0..source.len() {
            let point = Point::new(source.field_f64(i, sx), source.field_f64(i, sy));
            if !self.bbox.contains(point) {
                continue;
            }
            self.schema.pack(src_schema, source.row(i), origin, &mut scratch);
            if self.sleeper.add_point(point, &scratch) {
                accepted += 1;
            }
        }

        if accepted > 0 {
            self.schema.freeze();
            self.num_points.fetch_add(accepted, Ordering::Relaxed);
        }
        tracing::debug!(
            pipeline = %self.pipeline_id,
            origin,
            accepted,
            dropped = source.len() as u64 - accepted,
            "insert"
        );
        Ok(accepted)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Points of every node within the depth band, depth-ascending.
    pub fn get_points(&self, depth_begin: u64, depth_end: u64) -> Vec<PointEntry> {
        self.sleeper.get_points(depth_begin, depth_end)
    }

    /// Depth band intersected with a bounding region.
    pub fn get_points_in(&self, query: &BBox, depth_begin: u64, depth_end: u64) -> Vec<PointEntry> {
        self.sleeper.get_points_in(query, depth_begin, depth_end)
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Framed serialized image of the tree (header + compressed base
    /// page).
    ///
    /// Overflow entries past the base band are NOT part of the image;
    /// when any exist their count is logged so the loss is observable.
    /// Check [`SleepyTree::overflow_count`] before persisting if the
    /// caller cannot tolerate the drop.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let overflow = self.sleeper.overflow_count();
        if overflow > 0 {
            tracing::warn!(
                pipeline = %self.pipeline_id,
                overflow,
                "overflow entries past the base band are not serialized"
            );
        }

        let image = self.sleeper.page().snapshot();
        let compressed = stream::compress(&image, &self.schema)?;

        let mut out = Vec::with_capacity(FILE_HEADER_SIZE + compressed.len());
        out.extend_from_slice(&self.bbox.x_min.to_le_bytes());
        out.extend_from_slice(&self.bbox.y_min.to_le_bytes());
        out.extend_from_slice(&self.bbox.x_max.to_le_bytes());
        out.extend_from_slice(&self.bbox.y_max.to_le_bytes());
        out.extend_from_slice(&(image.len() as u64).to_le_bytes());
        out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Write the framed image to a file, creating parent directories.
    /// Only the base band is persisted; see [`SleepyTree::serialize`].
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.serialize()?;
        std::fs::write(path, &bytes)?;
        tracing::info!(
            pipeline = %self.pipeline_id,
            points = self.num_points(),
            bytes = bytes.len(),
            path = %path.display(),
            "tree saved"
        );
        Ok(())
    }

    /// Load a tree previously written by [`SleepyTree::save`]. The file
    /// stores no schema; the caller supplies the same one used to build
    /// the tree.
    pub fn load(pipeline_id: &str, path: &Path, schema: Schema) -> Result<Self> {
        Self::load_with_base_depth(pipeline_id, path, schema, BASE_DEPTH)
    }

    pub fn load_with_base_depth(
        pipeline_id: &str,
        path: &Path,
        schema: Schema,
        base_depth: usize,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let tree = Self::deserialize_with_base_depth(pipeline_id, &mmap, schema, base_depth)?;
        tracing::info!(
            pipeline = %pipeline_id,
            points = tree.num_points(),
            path = %path.display(),
            "tree loaded"
        );
        Ok(tree)
    }

    /// Parse a framed image produced by [`SleepyTree::serialize`].
    pub fn deserialize(pipeline_id: &str, bytes: &[u8], schema: Schema) -> Result<Self> {
        Self::deserialize_with_base_depth(pipeline_id, bytes, schema, BASE_DEPTH)
    }

    pub fn deserialize_with_base_depth(
        pipeline_id: &str,
        bytes: &[u8],
        schema: Schema,
        base_depth: usize,
    ) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(PointError::CorruptHeader(format!(
                "file is {} bytes, header needs {}",
                bytes.len(),
                FILE_HEADER_SIZE
            )));
        }

        let f = |i: usize| f64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        let bbox = BBox::new(f(0), f(1), f(2), f(3));
        let uncompressed_size = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
        let compressed_size = u64::from_le_bytes(bytes[40..48].try_into().unwrap()) as usize;

        if FILE_HEADER_SIZE + compressed_size != bytes.len() {
            return Err(PointError::CorruptHeader(format!(
                "compressed size {} disagrees with {} payload bytes",
                compressed_size,
                bytes.len() - FILE_HEADER_SIZE
            )));
        }

        let (schema, origin_dim) = Self::prepare_schema(schema)?;
        let stride = schema.point_size();
        let expected = page_capacity(base_depth) * stride;
        if uncompressed_size != expected {
            return Err(PointError::CorruptPayload(format!(
                "base page is {} bytes, expected {} for this schema",
                uncompressed_size, expected
            )));
        }

        let image = stream::decompress(&bytes[FILE_HEADER_SIZE..], &schema, uncompressed_size)
            .map_err(|e| PointError::CorruptPayload(e.to_string()))?;

        let (page, occupied) = BasePage::from_bytes(&image, stride, base_depth);
        let sleeper = Sleeper::with_page(bbox, Arc::clone(&schema), base_depth, page);

        if occupied > 0 {
            schema.freeze();
        }
        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            bbox,
            schema,
            origin_dim,
            num_points: AtomicU64::new(occupied),
            sleeper,
        })
    }

    // ── Object-Store Persistence ───────────────────────────────────

    /// Key of the serialized tree within the configured bucket.
    pub fn remote_key(pipeline_id: &str) -> String {
        format!("{}/0", pipeline_id)
    }

    /// Persist the framed image through the object-store client.
    pub fn save_remote(&self, s3: &S3) -> Result<()> {
        let bytes = self.serialize()?;
        s3.put(&Self::remote_key(&self.pipeline_id), &bytes)?
            .into_result()?;
        tracing::info!(
            pipeline = %self.pipeline_id,
            points = self.num_points(),
            bytes = bytes.len(),
            "tree saved to object store"
        );
        Ok(())
    }

    /// Fetch and parse a tree persisted by [`SleepyTree::save_remote`].
    pub fn load_remote(pipeline_id: &str, s3: &S3, schema: Schema) -> Result<Self> {
        let body = s3.get(&Self::remote_key(pipeline_id))?.into_result()?;
        Self::deserialize(pipeline_id, &body, schema)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
