//! Object-store client (S3 dialect, AWS V2 signatures).
//!
//! Requests are plain HTTP against `http://<base>/<bucket>/<key>`. Every
//! request carries a `Date` header and an `Authorization: AWS
//! <keyId>:<signature>` header, where the signature is HMAC-SHA1 over
//!
//! ```text
//! METHOD\n
//! \n              (Content-MD5, always empty)
//! CONTENT_TYPE\n
//! DATE\n
//! RESOURCE
//! ```
//!
//! base64-encoded. The client holds one connection batch from the
//! process pool for its lifetime; asynchronous variants run on a bounded
//! worker pool and deliver into a [`Collector`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::Result;
use crate::http::collector::{Collector, FetchState};
use crate::http::pool::{HttpBatch, HttpPool, HttpResponse, WorkerPool};

type HmacSha1 = Hmac<Sha1>;

/// Threads serving asynchronous GET/PUT calls per client.
const ASYNC_WORKERS: usize = 4;
const ASYNC_QUEUE_DEPTH: usize = 64;

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub base_url: String,
    pub bucket: String,
}

impl S3Config {
    pub fn new(access_key_id: &str, secret_access_key: &str, bucket: &str) -> Self {
        Self::with_base_url(access_key_id, secret_access_key, "s3.amazonaws.com", bucket)
    }

    pub fn with_base_url(
        access_key_id: &str,
        secret_access_key: &str,
        base_url: &str,
        bucket: &str,
    ) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        }
    }
}

// ── Signing ────────────────────────────────────────────────────────

fn prefix_slash(s: &str) -> String {
    if s.is_empty() || s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{}", s)
    }
}

/// `Date` header value for request signing.
fn http_date() -> String {
    chrono::Local::now()
        .format("%a, %d %b %Y %H:%M:%S %z")
        .to_string()
}

/// The V2 string-to-sign. Content-MD5 is never sent, so its line stays
/// empty.
pub fn string_to_sign(method: &str, content_type: &str, date: &str, resource: &str) -> String {
    format!("{}\n\n{}\n{}\n{}", method, content_type, date, resource)
}

/// HMAC-SHA1 of the string-to-sign under the secret key.
pub fn sign_string(secret: &str, input: &str) -> Vec<u8> {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(input.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Signature as it appears in the Authorization header.
pub fn signed_encoded(secret: &str, input: &str) -> String {
    STANDARD.encode(sign_string(secret, input))
}

// ── S3 ─────────────────────────────────────────────────────────────

pub struct S3 {
    config: S3Config,
    pool: Arc<HttpPool>,
    batch: Option<HttpBatch>,
    workers: WorkerPool,
}

impl S3 {
    /// Acquire a connection batch and build a client. Fails with
    /// `Unavailable` when the pool is exhausted.
    pub fn new(config: S3Config, pool: Arc<HttpPool>) -> Result<Self> {
        let batch = pool.acquire()?;
        Ok(Self {
            config,
            pool,
            batch: Some(batch),
            workers: WorkerPool::new(ASYNC_WORKERS, ASYNC_QUEUE_DEPTH),
        })
    }

    /// `/<bucket>/<key>`, both segments slash-normalized.
    fn resource(&self, key: &str) -> String {
        format!(
            "{}{}",
            prefix_slash(&self.config.bucket),
            prefix_slash(key)
        )
    }

    fn url(&self, resource: &str) -> String {
        format!("http://{}{}", self.config.base_url, resource)
    }

    fn auth_header(&self, signature: String) -> (String, String) {
        (
            "Authorization".to_string(),
            format!("AWS {}:{}", self.config.access_key_id, signature),
        )
    }

    fn get_headers(&self, resource: &str, date: &str) -> Vec<(String, String)> {
        let to_sign = string_to_sign("GET", "", date, resource);
        let signature = signed_encoded(&self.config.secret_access_key, &to_sign);
        vec![
            ("Date".to_string(), date.to_string()),
            self.auth_header(signature),
        ]
    }

    fn put_headers(&self, resource: &str, date: &str) -> Vec<(String, String)> {
        let to_sign = string_to_sign("PUT", "application/octet-stream", date, resource);
        let signature = signed_encoded(&self.config.secret_access_key, &to_sign);
        vec![
            (
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            ),
            ("Date".to_string(), date.to_string()),
            self.auth_header(signature),
        ]
    }

    fn batch(&self) -> &HttpBatch {
        self.batch.as_ref().expect("batch held until drop")
    }

    // ── Synchronous Calls ──────────────────────────────────────────

    /// Fetch an object. Error statuses come back in the response; only
    /// transport failures error out.
    pub fn get(&self, key: &str) -> Result<HttpResponse> {
        let resource = self.resource(key);
        let date = http_date();
        self.batch()
            .get(&self.url(&resource), &self.get_headers(&resource, &date))
    }

    /// Store an object as `application/octet-stream`.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<HttpResponse> {
        let resource = self.resource(key);
        let date = http_date();
        self.batch()
            .put(&self.url(&resource), &self.put_headers(&resource, &date), data)
    }

    // ── Asynchronous Calls ─────────────────────────────────────────

    /// Fetch on a worker; the outcome lands in the collector under `id`.
    pub fn get_async(self: &Arc<Self>, id: u64, key: &str, collector: &Arc<Collector>) {
        collector.register(id);
        let this = Arc::clone(self);
        let collector = Arc::clone(collector);
        let key = key.to_string();
        self.workers.submit(move || {
            let state = match this.get(&key) {
                Ok(response) => FetchState::Completed(response),
                Err(e) => FetchState::Failed(e.to_string()),
            };
            if let FetchState::Failed(msg) = &state {
                tracing::warn!(key = %key, error = %msg, "async GET failed");
            }
            collector.insert(id, state);
        });
    }

    /// Store on a worker; the outcome lands in the collector under `id`.
    pub fn put_async(self: &Arc<Self>, id: u64, key: &str, data: Vec<u8>, collector: &Arc<Collector>) {
        collector.register(id);
        let this = Arc::clone(self);
        let collector = Arc::clone(collector);
        let key = key.to_string();
        self.workers.submit(move || {
            let state = match this.put(&key, &data) {
                Ok(response) => FetchState::Completed(response),
                Err(e) => FetchState::Failed(e.to_string()),
            };
            if let FetchState::Failed(msg) = &state {
                tracing::warn!(key = %key, error = %msg, "async PUT failed");
            }
            collector.insert(id, state);
        });
    }
}

impl Drop for S3 {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            self.pool.release(batch);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_string_to_sign_layout() {
        assert_eq!(string_to_sign("GET", "", "D", "/b/k"), "GET\n\n\nD\n/b/k");
        assert_eq!(
            string_to_sign("PUT", "application/octet-stream", "D", "/b/k"),
            "PUT\n\napplication/octet-stream\nD\n/b/k"
        );
    }

    #[test]
    fn test_hmac_sha1_known_vector() {
        // RFC 2202 / canonical example: HMAC-SHA1("key", "The quick
        // brown fox jumps over the lazy dog").
        let sig = sign_string("key", "The quick brown fox jumps over the lazy dog");
        let hex: String = sig.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9");
        assert_eq!(
            signed_encoded("key", "The quick brown fox jumps over the lazy dog"),
            "3nybhbi3iqa8ino29wqQcBydtNk="
        );
    }

    #[test]
    fn test_base64_corners() {
        assert_eq!(STANDARD.encode([]), "");
        assert_eq!(STANDARD.encode([0x4d]), "TQ==");
        assert_eq!(STANDARD.encode([0x4d, 0x61]), "TWE=");
        assert_eq!(STANDARD.encode([0x4d, 0x61, 0x6e]), "TWFu");
    }

    #[test]
    fn test_prefix_slash() {
        assert_eq!(prefix_slash("bucket"), "/bucket");
        assert_eq!(prefix_slash("/bucket"), "/bucket");
        assert_eq!(prefix_slash(""), "");
    }

    fn test_client(base_url: &str) -> Result<S3> {
        let pool = Arc::new(HttpPool::new(1, 2));
        S3::new(
            S3Config::with_base_url("AKID", "secret", base_url, "bucket"),
            pool,
        )
    }

    #[test]
    fn test_resource_and_headers() {
        let s3 = test_client("s3.amazonaws.com").unwrap();
        let resource = s3.resource("dir/file");
        assert_eq!(resource, "/bucket/dir/file");
        assert_eq!(s3.url(&resource), "http://s3.amazonaws.com/bucket/dir/file");

        let headers = s3.put_headers(&resource, "Thu, 01 Jan 1970 00:00:00 +0000");
        assert_eq!(headers[0].0, "Content-Type");
        assert_eq!(headers[0].1, "application/octet-stream");
        assert_eq!(headers[1].0, "Date");
        assert!(headers[2].1.starts_with("AWS AKID:"));

        let get_headers = s3.get_headers(&resource, "D");
        assert_eq!(get_headers.len(), 2);
    }

    #[test]
    fn test_batch_released_on_drop() {
        let pool = Arc::new(HttpPool::new(1, 2));
        {
            let _s3 = S3::new(S3Config::new("AKID", "secret", "bucket"), Arc::clone(&pool))
                .unwrap();
        }
        // The single batch is back in the free list.
        let batch = pool.acquire().unwrap();
        pool.release(batch);
    }

    /// Minimal one-request HTTP server: answers with the given status
    /// and body, returns the raw request head it saw.
    fn one_shot_server(
        status: &'static str,
        body: &'static [u8],
    ) -> (u16, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = conn.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&request).into_owned();
            // Drain a body if the client announced one.
            if let Some(len) = head
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse::<usize>().ok())
            {
                let already = request
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map(|p| request.len() - (p + 4))
                    .unwrap_or(0);
                let mut remaining = len.saturating_sub(already);
                while remaining > 0 {
                    let n = conn.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    remaining -= n;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            conn.write_all(response.as_bytes()).unwrap();
            conn.write_all(body).unwrap();
            head
        });
        (port, handle)
    }

    #[test]
    fn test_get_round_trip() {
        let (port, server) = one_shot_server("200 OK", b"payload");
        let s3 = test_client(&format!("127.0.0.1:{}", port)).unwrap();

        let response = s3.get("some/key").unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body, b"payload");

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /bucket/some/key HTTP/1.1"));
        assert!(head.contains("Authorization: AWS AKID:"));
        assert!(head.contains("Date: "));
        // Neither chunked transfer nor 100-continue.
        assert!(!head.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(!head.to_ascii_lowercase().contains("expect:"));
    }

    #[test]
    fn test_put_round_trip() {
        let (port, server) = one_shot_server("200 OK", b"");
        let s3 = test_client(&format!("127.0.0.1:{}", port)).unwrap();

        let response = s3.put("k", &[1, 2, 3, 4]).unwrap();
        assert!(response.ok());

        let head = server.join().unwrap();
        assert!(head.starts_with("PUT /bucket/k HTTP/1.1"));
        assert!(head.contains("Content-Type: application/octet-stream"));
        assert!(head.contains("Content-Length: 4"));
    }

    #[test]
    fn test_error_status_maps_to_remote() {
        let (port, _server) = one_shot_server("403 Forbidden", b"denied");
        let s3 = test_client(&format!("127.0.0.1:{}", port)).unwrap();

        let response = s3.get("k").unwrap();
        assert_eq!(response.code, 403);
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), "REMOTE_ERROR");
    }

    #[test]
    fn test_async_get_delivers_to_collector() {
        let (port, _server) = one_shot_server("200 OK", b"async-body");
        let s3 = Arc::new(test_client(&format!("127.0.0.1:{}", port)).unwrap());
        let collector = Arc::new(Collector::new());

        s3.get_async(42, "k", &collector);
        let state = collector
            .wait(42, std::time::Duration::from_secs(10))
            .unwrap();
        match state {
            FetchState::Completed(response) => {
                assert_eq!(response.code, 200);
                assert_eq!(response.body, b"async-body");
            }
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(collector.arrived(), vec![42]);
    }

    #[test]
    fn test_async_transport_failure_is_surfaced() {
        // Nothing listens on the probe port.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let s3 = Arc::new(test_client(&format!("127.0.0.1:{}", port)).unwrap());
        let collector = Arc::new(Collector::new());

        s3.put_async(7, "k", vec![0u8; 4], &collector);
        let state = collector
            .wait(7, std::time::Duration::from_secs(10))
            .unwrap();
        assert!(matches!(state, FetchState::Failed(_)));
    }
}
