//! HTTP connection batches and the process-wide batch pool.
//!
//! The pool is a free list of `HttpBatch` values, each wrapping one
//! keep-alive agent sized to a fixed number of connection slots. A
//! client acquires a batch for its lifetime and releases it on drop;
//! acquisition past the deadline fails with `Unavailable` instead of
//! queueing forever.

use std::io::Read;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{PointError, Result};

/// Default pool shape: batches × slots.
pub const DEFAULT_NUM_BATCHES: usize = 16;
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// How long `acquire` waits for a free batch.
pub const ACQUIRE_DEADLINE: Duration = Duration::from_secs(30);

/// Per-request timeout enforced by every batch agent.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ── HttpResponse ───────────────────────────────────────────────────

/// Status code plus body, for both success and error statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        (200..=299).contains(&self.code)
    }

    /// Body on 2xx, `Remote` error otherwise.
    pub fn into_result(self) -> Result<Vec<u8>> {
        if self.ok() {
            Ok(self.body)
        } else {
            Err(PointError::Remote {
                status: self.code,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }
}

// ── HttpBatch ──────────────────────────────────────────────────────

/// One batch of reusable keep-alive connections.
pub struct HttpBatch {
    agent: ureq::Agent,
}

impl HttpBatch {
    fn new(slots: usize) -> Self {
        let agent = ureq::AgentBuilder::new()
            .max_idle_connections(slots)
            .max_idle_connections_per_host(slots)
            .timeout(REQUEST_TIMEOUT)
            .build();
        Self { agent }
    }

    /// Issue a GET. Error statuses come back as a response, not an
    /// error; only transport failures error out.
    pub fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.agent.get(url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        Self::complete(request.call())
    }

    /// Issue a PUT with the given body. The body length is always known,
    /// so the request is never chunked and never sends Expect.
    pub fn put(&self, url: &str, headers: &[(String, String)], data: &[u8]) -> Result<HttpResponse> {
        let mut request = self.agent.put(url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        Self::complete(request.send_bytes(data))
    }

    fn complete(outcome: std::result::Result<ureq::Response, ureq::Error>) -> Result<HttpResponse> {
        let response = match outcome {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(t)) => {
                return Err(PointError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    t.to_string(),
                )));
            }
        };
        let code = response.status();
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(HttpResponse { code, body })
    }
}

// ── HttpPool ───────────────────────────────────────────────────────

/// Free list of HTTP batches. Process-wide: created at startup and
/// handed to every component that needs persistence.
pub struct HttpPool {
    free_tx: Sender<HttpBatch>,
    free_rx: Receiver<HttpBatch>,
    deadline: Duration,
}

impl HttpPool {
    pub fn new(num_batches: usize, batch_size: usize) -> Self {
        let (free_tx, free_rx) = bounded(num_batches);
        for _ in 0..num_batches {
            free_tx
                .send(HttpBatch::new(batch_size))
                .expect("channel sized to hold every batch");
        }
        Self {
            free_tx,
            free_rx,
            deadline: ACQUIRE_DEADLINE,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_NUM_BATCHES, DEFAULT_BATCH_SIZE)
    }

    /// Take a batch from the free list, failing with `Unavailable` once
    /// the deadline passes.
    pub fn acquire(&self) -> Result<HttpBatch> {
        self.free_rx
            .recv_timeout(self.deadline)
            .map_err(|_| PointError::Unavailable)
    }

    /// Return a batch to the free list.
    pub fn release(&self, batch: HttpBatch) {
        let _ = self.free_tx.send(batch);
    }
}

// ── WorkerPool ─────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of worker threads for asynchronous persistence calls.
/// Dropping the pool closes the queue and joins the workers.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = bounded::<Job>(queue_depth);
        let handles = (0..threads)
            .map(|_| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
            })
            .collect();
        Self {
            tx: Some(tx),
            handles,
        }
    }

    /// Enqueue a job, blocking while the queue is full.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_acquire_release_cycle() {
        let pool = HttpPool::new(2, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        // Both are back; a third acquire succeeds immediately.
        let c = pool.acquire().unwrap();
        pool.release(c);
    }

    #[test]
    fn test_pool_exhaustion_is_unavailable() {
        let mut pool = HttpPool::new(1, 1);
        pool.deadline = Duration::from_millis(50);

        let held = pool.acquire().unwrap();
        match pool.acquire() {
            Err(PointError::Unavailable) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
        pool.release(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_worker_pool_runs_jobs_then_drains() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let workers = WorkerPool::new(4, 16);
            for _ in 0..32 {
                let counter = Arc::clone(&counter);
                workers.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            // Drop joins the workers after the queue drains.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
