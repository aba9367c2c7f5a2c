//! Session lifetime and the command surface behind the wire protocol.
//!
//! A session binds one point-cloud source: either a pipeline execution
//! that gets indexed into a fresh tree, or a previously serialized tree
//! reloaded from the serial root (or the object store, when configured).
//! `SessionManager` owns at most one live session and backs every
//! command of the line protocol.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::Deserialize;

use crate::error::{PointError, Result};
use crate::geometry::BBox;
use crate::http::{HttpPool, S3Config, S3};
use crate::query::ReadQuery;
use crate::schema::Schema;
use crate::source::{PipelineExecutor, SourceBuffer};
use crate::transmit::BufferTransmitter;
use crate::tree::{serial_path, SleepyTree};

/// getSRS is a placeholder until sources carry reference-system info.
pub const PLACEHOLDER_SRS: &str = "not available";

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root of the on-disk serial store: `<root>/<pipelineId>/0`.
    pub serial_root: PathBuf,
    /// When set, serialize/load go through the object store instead of
    /// the local serial root.
    pub s3: Option<S3Config>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial_root: PathBuf::from("/var/pcdb/serial"),
            s3: None,
        }
    }
}

// ── Read Request ───────────────────────────────────────────────────

/// Parameters of the `read` command.
///
/// Without `bbox` or a depth band this is an index-range read over the
/// whole result; with them it is a spatial read at the given level of
/// detail. `start`/`count` slice whichever result was materialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
    /// Wire form: [xMin, yMin, xMax, yMax]
    #[serde(default)]
    pub bbox: Option<BBox>,
    #[serde(default)]
    pub depth_begin: Option<i64>,
    #[serde(default)]
    pub depth_end: Option<i64>,
    pub transmit_host: String,
    pub transmit_port: u16,
    #[serde(default)]
    pub rasterize: bool,
}

/// What a `read` produced: the counts for the acknowledgement plus the
/// transmit outcome channel.
pub struct ReadOutcome {
    pub points_read: usize,
    pub num_bytes: usize,
    pub done: Receiver<Result<()>>,
}

impl std::fmt::Debug for ReadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOutcome")
            .field("points_read", &self.points_read)
            .field("num_bytes", &self.num_bytes)
            .finish()
    }
}

// ── Session ────────────────────────────────────────────────────────

pub struct Session {
    tree: SleepyTree,
    next_origin: AtomicU64,
}

impl Session {
    fn new(tree: SleepyTree) -> Self {
        Self {
            tree,
            next_origin: AtomicU64::new(0),
        }
    }

    pub fn tree(&self) -> &SleepyTree {
        &self.tree
    }

    /// Ingest one buffer under the next origin tag. Origins increase
    /// monotonically across calls within the session.
    pub fn ingest(&self, source: &SourceBuffer) -> Result<u64> {
        let origin = self.next_origin.fetch_add(1, Ordering::Relaxed);
        self.tree.insert(source, origin)
    }
}

// ── SessionManager ─────────────────────────────────────────────────

pub struct SessionManager {
    executor: Box<dyn PipelineExecutor>,
    config: SessionConfig,
    pool: Arc<HttpPool>,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(executor: Box<dyn PipelineExecutor>, config: SessionConfig) -> Self {
        Self {
            executor,
            config,
            pool: Arc::new(HttpPool::with_defaults()),
            session: None,
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(PointError::InvalidSession)
    }

    fn s3(&self) -> Result<Option<S3>> {
        match &self.config.s3 {
            Some(cfg) => Ok(Some(S3::new(cfg.clone(), Arc::clone(&self.pool))?)),
            None => Ok(None),
        }
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Bind a new session, replacing any existing one. With a pipeline
    /// the source is executed and indexed; without one the serialized
    /// tree for `pipeline_id` is reloaded.
    pub fn create(
        &mut self,
        pipeline_id: &str,
        pipeline: Option<&str>,
        debug: bool,
        verbose: u32,
    ) -> Result<()> {
        self.destroy();

        let session = match pipeline {
            Some(pipeline) => {
                let source = self.executor.execute(pipeline, debug, verbose)?;
                let bbox = source_extent(&source)?;
                let tree = SleepyTree::new(pipeline_id, bbox, Schema::standard())?;
                let session = Session::new(tree);
                session.ingest(&source)?;
                session
            }
            None => {
                let tree = match self.s3()? {
                    Some(s3) => SleepyTree::load_remote(pipeline_id, &s3, Schema::standard())?,
                    None => {
                        let path = serial_path(&self.config.serial_root, pipeline_id);
                        SleepyTree::load(pipeline_id, &path, Schema::standard())?
                    }
                };
                Session::new(tree)
            }
        };

        tracing::info!(
            pipeline = %pipeline_id,
            points = session.tree.num_points(),
            "session created"
        );
        self.session = Some(session);
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!(pipeline = %session.tree.pipeline_id(), "session destroyed");
        }
    }

    pub fn is_valid(&self) -> bool {
        self.session.is_some()
    }

    pub fn num_points(&self) -> Result<u64> {
        Ok(self.session()?.tree.num_points())
    }

    pub fn schema_xml(&self) -> Result<String> {
        Ok(self.session()?.tree.schema().to_xml())
    }

    pub fn srs(&self) -> Result<String> {
        self.session()?;
        Ok(PLACEHOLDER_SRS.to_string())
    }

    /// Persist the session's tree to the serial root or the object
    /// store.
    pub fn serialize(&self) -> Result<()> {
        let session = self.session()?;
        match self.s3()? {
            Some(s3) => session.tree.save_remote(&s3),
            None => {
                let path = serial_path(&self.config.serial_root, session.tree.pipeline_id());
                session.tree.save(&path)
            }
        }
    }

    /// Materialize a read and ship it to the requested endpoint. The
    /// acknowledgement counts come back immediately; delivery runs on a
    /// detached worker whose outcome is `done`.
    pub fn read(&self, request: &ReadRequest) -> Result<ReadOutcome> {
        let session = self.session()?;
        let tree = &session.tree;

        let depth_begin = non_negative(request.depth_begin)?.unwrap_or(0);
        let depth_end = match non_negative(request.depth_end)? {
            Some(end) => end,
            None => u64::MAX,
        };
        if request.depth_begin.is_some() || request.depth_end.is_some() {
            // Band validity gets the full picture: both bounds at once.
            if depth_begin > depth_end {
                return Err(PointError::BadDepth {
                    begin: depth_begin as i64,
                    end: depth_end as i64,
                });
            }
        }

        let entries = match &request.bbox {
            Some(query) => tree.get_points_in(query, depth_begin, depth_end),
            None => tree.get_points(depth_begin, depth_end),
        };

        let start = index_arg(request.start, "start")?.unwrap_or(0);
        let count = index_arg(request.count, "count")?;
        let sliced: Vec<_> = match count {
            _ if start >= entries.len() => Vec::new(),
            Some(count) => entries[start..(start + count).min(entries.len())].to_vec(),
            None => entries[start..].to_vec(),
        };

        let mut query = ReadQuery::new(sliced);
        let points_read = query.num_points();
        let buffer = query.read_all(tree.schema())?;
        let num_bytes = buffer.len();

        let done =
            BufferTransmitter::new(&request.transmit_host, request.transmit_port, buffer).spawn();
        tracing::debug!(
            pipeline = %tree.pipeline_id(),
            points = points_read,
            bytes = num_bytes,
            host = %request.transmit_host,
            port = request.transmit_port,
            "read queued"
        );
        Ok(ReadOutcome {
            points_read,
            num_bytes,
            done,
        })
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Tight bounds over the source's XY extent, used as the tree bounds
/// when the pipeline does not dictate any.
fn source_extent(source: &SourceBuffer) -> Result<BBox> {
    let schema = source.schema();
    let x = schema
        .find("X")
        .ok_or_else(|| PointError::InvalidPipeline("source has no X dimension".to_string()))?;
    let y = schema
        .find("Y")
        .ok_or_else(|| PointError::InvalidPipeline("source has no Y dimension".to_string()))?;

    let mut bbox = BBox::new(0.0, 0.0, 0.0, 0.0);
    for i in 0..source.len() {
        let px = source.field_f64(i, x);
        let py = source.field_f64(i, y);
        if i == 0 {
            bbox = BBox::new(px, py, px, py);
        } else {
            bbox.x_min = bbox.x_min.min(px);
            bbox.y_min = bbox.y_min.min(py);
            bbox.x_max = bbox.x_max.max(px);
            bbox.y_max = bbox.y_max.max(py);
        }
    }
    Ok(bbox)
}

fn non_negative(value: Option<i64>) -> Result<Option<u64>> {
    match value {
        Some(v) if v < 0 => Err(PointError::BadDepth { begin: v, end: v }),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

fn index_arg(value: Option<i64>, name: &str) -> Result<Option<usize>> {
    match value {
        Some(v) if v < 0 => Err(PointError::InvalidArgument(format!(
            "{} must be non-negative, got {}",
            name, v
        ))),
        Some(v) => Ok(Some(v as usize)),
        None => Ok(None),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
