// Obfuscation module for DPI bypass
//
// Provides the reversible packet transforms applied around the secure
// transport: a keyed XOR mask and per-packet LZ4 compression, composed by
// `Pipeline`.

pub mod compression;
pub mod pipeline;
pub mod xor;

pub use compression::Compressor;
pub use pipeline::Pipeline;
pub use xor::Obfuscator;

use thiserror::Error;

/// Errors raised by the packet transforms.
///
/// A decode failure means the peers disagree on framing or codec settings, or
/// the payload was corrupted; the owning connection cannot be trusted after it.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Obfuscation was enabled without a key.
    #[error("obfuscation key must not be empty")]
    EmptyKey,
    /// Compressed payload too short to carry its size prefix.
    #[error("compressed payload truncated ({0} bytes)")]
    Truncated(usize),
    /// Size prefix claims more than any IP packet can hold.
    #[error("compressed payload claims {claimed} bytes (limit {limit})")]
    Oversized { claimed: usize, limit: usize },
    /// Block inflated to a different size than its prefix announced.
    #[error("compressed payload inflated to {actual} bytes, expected {claimed}")]
    SizeMismatch { claimed: usize, actual: usize },
    /// Malformed LZ4 block.
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}
