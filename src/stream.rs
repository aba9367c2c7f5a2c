//! Byte stream under the LAZ-family codec.
//!
//! `CompressionStream` is a random-append sink and positional source over
//! an in-memory vector. It makes no framing decisions; the tree layer
//! prepends uncompressed- and compressed-size headers around the payload.
//!
//! The stream also implements `io::Read + Write + Seek` so it can sit
//! directly under `laz`'s compressor and decompressor, which seek back to
//! patch their chunk table offset.

use std::io::{self, Read, Seek, SeekFrom, Write};

use laz::{LasZipCompressor, LasZipDecompressor, LazItemRecordBuilder, LazItemType, LazVlr};

use crate::error::{PointError, Result};
use crate::schema::Schema;

// ── CompressionStream ──────────────────────────────────────────────

/// In-memory byte sink/source adapting the codec to plain vectors.
#[derive(Debug, Default)]
pub struct CompressionStream {
    data: Vec<u8>,
    /// Read cursor of the explicit `get_*` API; starts at 0.
    index: usize,
    /// Position of the `io` trait surface, independent of `index`.
    pos: u64,
}

impl CompressionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing buffer for reading.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            index: 0,
            pos: 0,
        }
    }

    /// Append one byte at the end.
    pub fn put_byte(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Append a run of bytes at the end.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Read the next byte at the read cursor.
    pub fn get_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    /// Read `out.len()` bytes at the read cursor, failing with `ShortRead`
    /// when fewer remain.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let remaining = self.data.len() - self.index;
        if out.len() > remaining {
            return Err(PointError::ShortRead {
                wanted: out.len(),
                remaining,
            });
        }
        out.copy_from_slice(&self.data[self.index..self.index + out.len()]);
        self.index += out.len();
        Ok(())
    }

    /// Borrow the underlying buffer without copy.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Write for CompressionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.pos as usize;
        if pos > self.data.len() {
            self.data.resize(pos, 0);
        }
        let overlap = (self.data.len() - pos).min(buf.len());
        self.data[pos..pos + overlap].copy_from_slice(&buf[..overlap]);
        self.data.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for CompressionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = (self.pos as usize).min(self.data.len());
        let n = (self.data.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for CompressionStream {
    fn seek(&mut self, style: SeekFrom) -> io::Result<u64> {
        let next = match style {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.data.len() as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

// ── Codec Helpers ──────────────────────────────────────────────────

/// Build the codec record description from the schema's dimension
/// sequence: one extra-bytes item per dimension.
fn laz_vlr(schema: &Schema) -> LazVlr {
    let mut builder = LazItemRecordBuilder::new();
    for dim in schema.dims() {
        builder.add_item(LazItemType::Byte(dim.ty.size() as u16));
    }
    LazVlr::from_laz_items(builder.build())
}

/// Compress a run of packed records. `data.len()` must be a whole number
/// of records of `schema.point_size()` bytes.
pub fn compress(data: &[u8], schema: &Schema) -> Result<Vec<u8>> {
    debug_assert_eq!(data.len() % schema.point_size().max(1), 0);

    let mut compressor = LasZipCompressor::new(CompressionStream::new(), laz_vlr(schema))?;
    compressor.compress_many(data)?;
    compressor.done()?;
    Ok(compressor.into_inner().into_inner())
}

/// Decompress into exactly `uncompressed_size` bytes of packed records.
pub fn decompress(compressed: &[u8], schema: &Schema, uncompressed_size: usize) -> Result<Vec<u8>> {
    let stream = CompressionStream::with_data(compressed.to_vec());
    let mut decompressor = LasZipDecompressor::new(stream, laz_vlr(schema))?;
    let mut out = vec![0u8; uncompressed_size];
    decompressor.decompress_many(&mut out)?;
    Ok(out)
}

// ── Tests ──────────────────────────────────────────────────────────
