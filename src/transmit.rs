//! One-shot TCP blob transport.
//!
//! Ships a query result to the client-provided endpoint. The receiver
//! side may not be listening yet when the read command is acknowledged,
//! so connection attempts retry on a fixed backoff before giving up.
//! Transmission runs on its own worker; the spawning side gets a result
//! channel instead of a fire-and-forget thread, so failures are
//! observable.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};

use crate::error::Result;

/// Connection attempts before giving up (~50 s with the delay below).
pub const CONNECT_ATTEMPTS: usize = 500;

/// Fixed backoff between connection attempts.
pub const CONNECT_DELAY: Duration = Duration::from_millis(100);

pub struct BufferTransmitter {
    host: String,
    port: u16,
    data: Vec<u8>,
}

impl BufferTransmitter {
    pub fn new(host: &str, port: u16, data: Vec<u8>) -> Self {
        Self {
            host: host.to_string(),
            port,
            data,
        }
    }

    /// Connect (with retry), write the whole buffer, close.
    pub fn transmit(&self) -> Result<()> {
        let mut stream = self.connect()?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = (self.host.as_str(), self.port);
        let mut attempt = 0;
        loop {
            // Resolution happens per attempt; the receiver may appear late.
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempt += 1;
                    if attempt >= CONNECT_ATTEMPTS {
                        return Err(e.into());
                    }
                    std::thread::sleep(CONNECT_DELAY);
                }
            }
        }
    }

    /// Run the transmission on a worker thread. The returned channel
    /// carries the outcome; dropping it detaches the worker.
    pub fn spawn(self) -> Receiver<Result<()>> {
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let host = self.host.clone();
            let port = self.port;
            let bytes = self.data.len();
            let result = self.transmit();
            match &result {
                Ok(()) => tracing::debug!(host = %host, port, bytes, "blob transmitted"),
                Err(e) => tracing::warn!(host = %host, port, bytes, error = %e, "blob transmit failed"),
            }
            let _ = tx.send(result);
        });
        rx
    }
}

// ── Tests ──────────────────────────────────────────────────────────
