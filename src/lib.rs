//! PCDB: disk-backed spatial point-cloud engine for streaming session
//! queries.
//!
//! A session binds a point-cloud source (a pipeline execution or a
//! previously indexed dataset) to an out-of-core quadtree, the sleepy
//! tree: points stream in under origin tags, the root band lives in one
//! dense base page, and queries by depth band or bounding region come
//! back while the tree keeps mutating. Trees sleep on disk as framed
//! LAZ-compressed images, locally or in an S3-compatible object store,
//! and query results ship to client endpoints over a TCP blob channel.

pub mod error;
pub mod geometry;
pub mod http;
pub mod query;
pub mod schema;
pub mod session;
pub mod source;
pub mod stream;
pub mod transmit;
pub mod tree;

pub use error::{PointError, Result};
pub use geometry::{BBox, Point, Quadrant};
pub use http::{HttpPool, S3Config, S3};
pub use query::ReadQuery;
pub use schema::{DimId, DimType, Dimension, Schema};
pub use session::{ReadOutcome, ReadRequest, SessionConfig, SessionManager};
pub use source::{InlinePipeline, PipelineExecutor, SourceBuffer};
pub use stream::CompressionStream;
pub use transmit::BufferTransmitter;
pub use tree::{PointEntry, Sleeper, SleepyTree, BASE_DEPTH};
