// Packet transform pipeline
//
// Send path: obfuscate, then compress. Receive path: decompress, then
// deobfuscate. Disabled stages are the identity and borrow the input.

use super::{CodecError, Compressor, Obfuscator};
use crate::config::Config;
use std::borrow::Cow;

/// Composition of the optional obfuscation and compression stages
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    obfuscator: Option<Obfuscator>,
    compressor: Option<Compressor>,
}

impl Pipeline {
    pub fn new(obfuscator: Option<Obfuscator>, compressor: Option<Compressor>) -> Self {
        Self {
            obfuscator,
            compressor,
        }
    }

    /// Pipeline with both stages disabled
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build the stages enabled by `obfs` and `compress`
    pub fn from_config(config: &Config) -> Result<Self, CodecError> {
        let obfuscator = if config.obfs {
            Some(Obfuscator::new(config.key.as_bytes())?)
        } else {
            None
        };
        let compressor = config.compress.then(Compressor::new);
        Ok(Self::new(obfuscator, compressor))
    }

    pub fn is_identity(&self) -> bool {
        self.obfuscator.is_none() && self.compressor.is_none()
    }

    /// Transform an outgoing packet for the wire
    pub fn encode<'a>(&self, packet: &'a [u8]) -> Cow<'a, [u8]> {
        let mut data = Cow::Borrowed(packet);
        if let Some(obfs) = &self.obfuscator {
            obfs.apply_in_place(data.to_mut());
        }
        if let Some(compressor) = &self.compressor {
            data = Cow::Owned(compressor.compress(&data));
        }
        data
    }

    /// Restore a packet received from the wire
    ///
    /// # Errors
    ///
    /// Propagates decompression failures; the obfuscation stage cannot fail.
    pub fn decode<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, CodecError> {
        let mut data = Cow::Borrowed(payload);
        if let Some(compressor) = &self.compressor {
            data = Cow::Owned(compressor.decompress(&data)?);
        }
        if let Some(obfs) = &self.obfuscator {
            obfs.apply_in_place(data.to_mut());
        }
        Ok(data)
    }
}
