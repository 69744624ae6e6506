//! Body codec: zlib decompression for compressed queues.

use std::io::Read;

use flate2::read::ZlibDecoder;

#[derive(Debug, thiserror::Error)]
#[error("failed to decompress delivery body: {0}")]
pub struct DecompressionError(#[from] std::io::Error);

/// Decode a complete zlib stream.
pub fn decompress(body: &[u8]) -> Result<Vec<u8>, DecompressionError> {
    let mut out = Vec::with_capacity(body.len() * 2);
    ZlibDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}
