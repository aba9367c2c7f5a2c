//! Asynchronous persistence against an S3-compatible object store.
//!
//! A process-wide pool of HTTP connection batches, an AWS-V2-signing
//! client, and a collector for results of detached GET/PUT calls.

pub mod collector;
pub mod pool;
pub mod s3;

pub use collector::{Collector, FetchState};
pub use pool::{HttpBatch, HttpPool, HttpResponse, WorkerPool};
pub use s3::{S3Config, S3};
