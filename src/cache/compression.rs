//! Payload Compression
//!
//! LZ4 block compression for remote payloads, gated by a size threshold.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::CompressionManager;
//! use tiercache::config::CompressionConfig;
//!
//! let manager = CompressionManager::new(&CompressionConfig {
//!     threshold_bytes: 16,
//!     ..Default::default()
//! });
//!
//! let data = "Hello, tiered cache! ".repeat(20);
//! let compressed = manager.compress(data.as_bytes(), None).unwrap().expect("above threshold");
//!
//! let decompressed = manager.decompress(&compressed).unwrap();
//! assert_eq!(decompressed.as_ref(), data.as_bytes());
//! ```

use bytes::Bytes;

use crate::config::CompressionConfig;
use crate::error::{Error, Result};

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Algorithm name, used in error reports
    fn name(&self) -> &'static str;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 compressor (fast compression)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub fn new() -> Self {
        Self { level: 4 }
    }

    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        // Size-prefixed so decompression needs no side channel
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: self.name().into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: self.name().into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Applies the global compression policy to individual writes
pub struct CompressionManager {
    enabled: bool,
    threshold_bytes: usize,
    compressor: Box<dyn Compressor>,
}

impl CompressionManager {
    /// Create a manager from configuration
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold_bytes: config.threshold_bytes,
            compressor: Box::new(Lz4Compressor::with_level(config.level)),
        }
    }

    /// Decide whether a payload of `len` bytes should be compressed.
    ///
    /// An explicit per-write request wins over the global policy.
    pub fn should_compress(&self, len: usize, requested: Option<bool>) -> bool {
        match requested {
            Some(force) => force,
            None => self.enabled && len > self.threshold_bytes,
        }
    }

    /// Compress according to policy.
    ///
    /// Returns `Ok(None)` when the payload should be stored raw. Under the
    /// automatic policy a result that is not smaller than the input is
    /// discarded; a forced request always yields compressed bytes.
    pub fn compress(&self, data: &[u8], requested: Option<bool>) -> Result<Option<Bytes>> {
        if !self.should_compress(data.len(), requested) {
            return Ok(None);
        }

        match self.compressor.compress(data) {
            Ok(compressed) if requested == Some(true) || compressed.len() < data.len() => {
                Ok(Some(Bytes::from(compressed)))
            }
            Ok(_) => Ok(None),
            Err(e) if requested.is_none() => {
                tracing::warn!(error = %e, "Compression failed, storing uncompressed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Decompress a payload produced by [`CompressionManager::compress`]
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        self.compressor.decompress(data).map(Bytes::from)
    }

    /// Payloads above this size are compressed by default
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new(&CompressionConfig::default())
    }
}
