//! Per-file compression, with a running CRC-32 and byte counts
//!
//! A fresh [`Compressor`] is made for each file in the archive.
//! It passes chunks through (or deflates them) and counts what went in and
//! what came out, so that we can write the data descriptor once the file ends.

use std::io::{self, prelude::*};

use crc32fast::Hasher;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// The file is stored uncompressed
    #[default]
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
}

/// Deflate level used for every file.
const DEFLATE_LEVEL: u32 = 5;

/// The final CRC and sizes of a file's contents,
/// available once its compressor is finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryMetrics {
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

enum Encoder {
    Stored,
    // Raw deflate (no zlib or gzip wrapper), written into a buffer
    // that we drain after each chunk.
    Deflate(DeflateEncoder<Vec<u8>>),
}

/// Compresses one file's contents, chunk by chunk.
pub struct Compressor {
    encoder: Encoder,
    hasher: Hasher,
    uncompressed_size: u64,
    compressed_size: u64,
}

impl Compressor {
    pub fn new(method: CompressionMethod) -> Self {
        let encoder = match method {
            CompressionMethod::None => Encoder::Stored,
            CompressionMethod::Deflate => Encoder::Deflate(DeflateEncoder::new(
                Vec::new(),
                Compression::new(DEFLATE_LEVEL),
            )),
        };
        Self {
            encoder,
            hasher: Hasher::new(),
            uncompressed_size: 0,
            compressed_size: 0,
        }
    }

    /// Feeds a chunk of the file through the compressor,
    /// returning whatever compressed output is ready.
    ///
    /// Stored chunks come straight back out.
    /// Deflated ones may come back empty while the encoder buffers.
    pub fn process(&mut self, chunk: Vec<u8>) -> io::Result<Vec<u8>> {
        self.hasher.update(&chunk);
        self.uncompressed_size += chunk.len() as u64;

        let out = match &mut self.encoder {
            Encoder::Stored => chunk,
            Encoder::Deflate(deflater) => {
                deflater.write_all(&chunk)?;
                std::mem::take(deflater.get_mut())
            }
        };
        self.compressed_size += out.len() as u64;
        Ok(out)
    }

    /// Flushes the compressor after the last chunk,
    /// returning the remaining output and the file's final metrics.
    pub fn finish(mut self) -> io::Result<(Vec<u8>, EntryMetrics)> {
        let tail = match &mut self.encoder {
            Encoder::Stored => Vec::new(),
            Encoder::Deflate(deflater) => {
                deflater.try_finish()?;
                std::mem::take(deflater.get_mut())
            }
        };
        self.compressed_size += tail.len() as u64;

        let metrics = EntryMetrics {
            crc32: self.hasher.finalize(),
            uncompressed_size: self.uncompressed_size,
            compressed_size: self.compressed_size,
        };
        Ok((tail, metrics))
    }

    /// Bytes fed in so far
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Bytes handed back so far
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }
}
