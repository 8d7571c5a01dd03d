//! zlib body compression.

use crate::error::FrameError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| FrameError::Compress(e.to_string()))?;
    encoder.finish().map_err(|e| FrameError::Compress(e.to_string()))
}

/// Inflates `data`, refusing output larger than `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Decompress(e.to_string()))?;
    if out.len() > limit {
        return Err(FrameError::Decompress(format!(
            "decompressed body exceeds {limit} bytes"
        )));
    }
    Ok(out)
}
