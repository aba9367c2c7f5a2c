//! Input point buffers.
//!
//! A `SourceBuffer` is what a pipeline execution hands to the ingest
//! façade: packed rows under the pipeline's own schema. The real pipeline
//! reader lives outside this crate; `PipelineExecutor` is the seam, and
//! `InlinePipeline` executes the small JSON form used by the session
//! binary and the tests.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{PointError, Result};
use crate::schema::{DimType, Schema};

// ── SourceBuffer ───────────────────────────────────────────────────

/// Packed input rows plus the schema describing them.
#[derive(Debug)]
pub struct SourceBuffer {
    schema: Arc<Schema>,
    data: Vec<u8>,
    len: usize,
}

impl SourceBuffer {
    pub fn new(schema: Schema, data: Vec<u8>) -> Result<Self> {
        let stride = schema.point_size();
        if stride == 0 {
            return Err(PointError::InvalidPipeline(
                "source schema has no dimensions".to_string(),
            ));
        }
        if data.len() % stride != 0 {
            return Err(PointError::InvalidPipeline(format!(
                "source buffer length {} is not a multiple of stride {}",
                data.len(),
                stride
            )));
        }
        let len = data.len() / stride;
        Ok(Self {
            schema: Arc::new(schema),
            data,
            len,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Raw bytes of one row.
    pub fn row(&self, index: usize) -> &[u8] {
        let stride = self.schema.point_size();
        &self.data[index * stride..(index + 1) * stride]
    }

    /// Decode one field of one row as f64.
    pub fn field_f64(&self, index: usize, id: crate::schema::DimId) -> f64 {
        self.schema.field_f64(self.row(index), id)
    }
}

// ── Pipeline Seam ──────────────────────────────────────────────────

/// Executes a pipeline description into a point buffer. Implemented by
/// the external pipeline reader; `InlinePipeline` is the built-in form.
pub trait PipelineExecutor: Send + Sync {
    fn execute(&self, pipeline: &str, debug: bool, verbose: u32) -> Result<SourceBuffer>;
}

/// Built-in executor for inline JSON point tables:
///
/// ```json
/// {
///   "dims": [{"name": "X", "type": "double"}, ...],
///   "points": [[1.0, 2.0, ...], ...]
/// }
/// ```
///
/// `dims` may be omitted, in which case the rows follow the standard
/// session layout.
pub struct InlinePipeline;

#[derive(Deserialize)]
struct InlineDescription {
    #[serde(default)]
    dims: Vec<InlineDim>,
    points: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct InlineDim {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

impl PipelineExecutor for InlinePipeline {
    fn execute(&self, pipeline: &str, _debug: bool, verbose: u32) -> Result<SourceBuffer> {
        let desc: InlineDescription = serde_json::from_str(pipeline)
            .map_err(|e| PointError::InvalidPipeline(e.to_string()))?;

        let schema = if desc.dims.is_empty() {
            Schema::standard()
        } else {
            let mut schema = Schema::new();
            for dim in &desc.dims {
                let ty = DimType::from_name(&dim.ty).ok_or_else(|| {
                    PointError::InvalidPipeline(format!(
                        "unknown dimension type '{}' for '{}'",
                        dim.ty, dim.name
                    ))
                })?;
                schema.assign(&dim.name, ty)?;
            }
            schema
        };

        let stride = schema.point_size();
        let width = schema.dims().len();
        let mut data = vec![0u8; desc.points.len() * stride];

        for (i, row) in desc.points.iter().enumerate() {
            if row.len() != width {
                return Err(PointError::InvalidPipeline(format!(
                    "point {} has {} values, schema has {} dimensions",
                    i,
                    row.len(),
                    width
                )));
            }
            let out = &mut data[i * stride..(i + 1) * stride];
            for (dim, value) in schema.dims().iter().zip(row) {
                dim.ty
                    .write_from_f64(*value, &mut out[dim.offset..dim.offset + dim.ty.size()]);
            }
        }

        if verbose > 0 {
            tracing::debug!(points = desc.points.len(), stride, "inline pipeline executed");
        }
        SourceBuffer::new(schema, data)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
