// Repeating-key XOR obfuscation
//
// Alters the static byte pattern of tunneled packets so simple content
// fingerprinting does not match raw IP headers. This is not encryption: the
// TLS layer underneath already provides confidentiality.

use super::CodecError;
use std::sync::Arc;

/// Symmetric XOR transform keyed by a fixed byte string
#[derive(Debug, Clone)]
pub struct Obfuscator {
    key: Arc<[u8]>,
}

impl Obfuscator {
    /// Create an obfuscator for the given key
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EmptyKey` when `key` is empty.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, CodecError> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(Self { key: Arc::from(key) })
    }

    /// XOR `data` in place. Applying it twice restores the input.
    pub fn apply_in_place(&self, data: &mut [u8]) {
        for (byte, k) in data.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= k;
        }
    }

    /// XOR into a fresh buffer
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply_in_place(&mut out);
        out
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}
