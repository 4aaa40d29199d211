// LZ4 block compression for tunneled packets
//
// Each packet is compressed independently with its uncompressed length
// prepended as a little-endian u32. Decompression validates that length
// against the largest possible IP packet before allocating.

use super::CodecError;
use crate::constants::MAX_PACKET_SIZE;

/// Size of the uncompressed-length prefix
const SIZE_PREFIX_LEN: usize = 4;

/// Stateless per-packet compressor
#[derive(Debug, Clone)]
pub struct Compressor {
    /// Largest uncompressed size accepted by `decompress`
    limit: usize,
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            limit: MAX_PACKET_SIZE,
        }
    }

    /// Create a compressor that refuses to inflate beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }

    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress_prepend_size(data)
    }

    /// Inverse of `compress`.
    ///
    /// # Errors
    ///
    /// Fails on input shorter than the size prefix, on a claimed size above
    /// the limit, and on any malformed LZ4 block (including one that inflates
    /// to a different size than claimed).
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.len() < SIZE_PREFIX_LEN {
            return Err(CodecError::Truncated(data.len()));
        }
        let (prefix, block) = data.split_at(SIZE_PREFIX_LEN);
        let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if claimed > self.limit {
            return Err(CodecError::Oversized {
                claimed,
                limit: self.limit,
            });
        }
        let inflated = lz4_flex::block::decompress(block, claimed)?;
        if inflated.len() != claimed {
            return Err(CodecError::SizeMismatch {
                claimed,
                actual: inflated.len(),
            });
        }
        Ok(inflated)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}
