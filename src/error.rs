//! Error types for the point store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PointError>;

#[derive(Error, Debug)]
pub enum PointError {
    #[error("Schema is frozen, cannot assign dimension '{0}'")]
    SchemaFrozen(String),

    #[error("Duplicate dimension: {0}")]
    DuplicateDim(String),

    #[error("Invalid depth range: [{begin}, {end})")]
    BadDepth { begin: i64, end: i64 },

    #[error("Short read: wanted {wanted} bytes, {remaining} remain")]
    ShortRead { wanted: usize, remaining: usize },

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Remote returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("HTTP pool exhausted, no batch available within deadline")]
    Unavailable,

    #[error("Session is not valid")]
    InvalidSession,

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<laz::LasZipError> for PointError {
    fn from(e: laz::LasZipError) -> Self {
        PointError::Compression(e.to_string())
    }
}

impl PointError {
    /// Get error code for the session wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            PointError::SchemaFrozen(_) => "SCHEMA_FROZEN",
            PointError::DuplicateDim(_) => "DUPLICATE_DIM",
            PointError::BadDepth { .. } => "BAD_DEPTH",
            PointError::ShortRead { .. } => "SHORT_READ",
            PointError::CorruptHeader(_) => "CORRUPT_HEADER",
            PointError::CorruptPayload(_) => "CORRUPT_PAYLOAD",
            PointError::Remote { .. } => "REMOTE_ERROR",
            PointError::Unavailable => "UNAVAILABLE",
            PointError::InvalidSession => "INVALID_SESSION",
            PointError::InvalidPipeline(_) => "INVALID_PIPELINE",
            PointError::InvalidArgument(_) => "INVALID_ARGUMENT",
            _ => "INTERNAL_ERROR",
        }
    }
}
