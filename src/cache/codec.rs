//! Serialization Codec
//!
//! Converts values to plain bytes (JSON) and plain bytes to the remote wire
//! form:
//!
//! ```text
//! wire      := ["enc:" encrypt(inner)] | inner
//! inner     := ["lz4:" lz4(plain)] | plain
//! plain     := serde_json bytes
//! ```
//!
//! JSON text never starts with either marker, so unmarked payloads are
//! always raw.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::compression::CompressionManager;
use super::encryption::PayloadCipher;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Marker prefix for LZ4-compressed payloads
pub const COMPRESSED_MARKER: &[u8] = b"lz4:";

/// Marker prefix for encrypted payloads
pub const ENCRYPTED_MARKER: &[u8] = b"enc:";

/// A payload ready for the remote tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    pub bytes: Bytes,
    pub compressed: bool,
    pub encrypted: bool,
}

/// Value codec shared by both tiers
pub struct Codec {
    compression: CompressionManager,
    cipher: Option<PayloadCipher>,
}

impl Codec {
    /// Build a codec from engine configuration
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let cipher = config
            .encryption
            .key_bytes()?
            .map(|key| PayloadCipher::new(&key))
            .transpose()?;

        Ok(Self {
            compression: CompressionManager::new(&config.compression),
            cipher,
        })
    }

    /// Whether encrypted writes are possible
    pub fn encryption_available(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize a value to plain bytes
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::Encoding(format!("failed to serialize value: {e}")))
    }

    /// Deserialize plain bytes into a value
    pub fn deserialize<T: DeserializeOwned>(&self, plain: &[u8]) -> Result<T> {
        serde_json::from_slice(plain)
            .map_err(|e| Error::Encoding(format!("failed to deserialize value: {e}")))
    }

    /// Turn plain bytes into the remote wire form
    pub fn encode(&self, plain: &Bytes, compress: Option<bool>, encrypt: bool) -> Result<WirePayload> {
        let (inner, compressed) = match self.compression.compress(plain, compress)? {
            Some(compressed) => (with_marker(COMPRESSED_MARKER, &compressed), true),
            None => (plain.clone(), false),
        };

        if !encrypt {
            return Ok(WirePayload {
                bytes: inner,
                compressed,
                encrypted: false,
            });
        }

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            Error::InvalidOptions("encryption requested but encryption is not configured".into())
        })?;
        let sealed = cipher.encrypt(&inner)?;

        Ok(WirePayload {
            bytes: with_marker(ENCRYPTED_MARKER, &sealed),
            compressed,
            encrypted: true,
        })
    }

    /// Turn a remote wire payload back into plain bytes
    pub fn decode(&self, wire: &Bytes) -> Result<WirePayload> {
        let (inner, encrypted) = match wire.strip_prefix(ENCRYPTED_MARKER) {
            Some(sealed) => {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    Error::Encryption("encrypted payload but no key is configured".into())
                })?;
                (cipher.decrypt(sealed)?, true)
            }
            None => (wire.clone(), false),
        };

        let (plain, compressed) = match inner.strip_prefix(COMPRESSED_MARKER) {
            Some(packed) => (self.compression.decompress(packed)?, true),
            None => (inner, false),
        };

        Ok(WirePayload {
            bytes: plain,
            compressed,
            encrypted,
        })
    }
}

fn with_marker(marker: &[u8], body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(marker.len() + body.len());
    out.put_slice(marker);
    out.put_slice(body);
    out.freeze()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        roles: Vec<String>,
    }

    fn codec(threshold: usize) -> Codec {
        let mut config = CacheConfig::default();
        config.compression.threshold_bytes = threshold;
        config.encryption.enabled = true;
        config.encryption.key = Some(BASE64.encode([9u8; 32]));
        Codec::new(&config).unwrap()
    }

    fn big_user() -> User {
        User {
            name: "Ana".repeat(200),
            roles: vec!["admin".into(); 50],
        }
    }

    #[test]
    fn test_small_value_is_raw_json() {
        let codec = codec(1024);
        let plain = codec.serialize(&User { name: "Ana".into(), roles: vec![] }).unwrap();
        let wire = codec.encode(&plain, None, false).unwrap();

        assert!(!wire.compressed);
        assert!(!wire.encrypted);
        assert_eq!(wire.bytes, plain);
        assert!(wire.bytes.starts_with(b"{"));
    }

    #[test]
    fn test_large_value_gets_marker() {
        let codec = codec(64);
        let user = big_user();
        let plain = codec.serialize(&user).unwrap();
        let wire = codec.encode(&plain, None, false).unwrap();

        assert!(wire.compressed);
        assert!(wire.bytes.starts_with(COMPRESSED_MARKER));
        assert!(wire.bytes.len() < plain.len());

        let decoded = codec.decode(&wire.bytes).unwrap();
        assert!(decoded.compressed);
        assert_eq!(codec.deserialize::<User>(&decoded.bytes).unwrap(), user);
    }

    #[test]
    fn test_encrypted_and_compressed_roundtrip() {
        let codec = codec(64);
        let user = big_user();
        let plain = codec.serialize(&user).unwrap();
        let wire = codec.encode(&plain, None, true).unwrap();

        assert!(wire.encrypted && wire.compressed);
        assert!(wire.bytes.starts_with(ENCRYPTED_MARKER));

        let decoded = codec.decode(&wire.bytes).unwrap();
        assert!(decoded.encrypted && decoded.compressed);
        assert_eq!(decoded.bytes, plain);
    }

    #[test]
    fn test_encrypt_without_key_is_invalid_options() {
        let codec = Codec::new(&CacheConfig::default()).unwrap();
        assert!(!codec.encryption_available());
        let err = codec.encode(&Bytes::from_static(b"1"), None, true).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_decode_encrypted_without_key_fails() {
        let sealed = codec(1024).encode(&Bytes::from_static(b"42"), None, true).unwrap();
        let plain_codec = Codec::new(&CacheConfig::default()).unwrap();
        assert!(matches!(
            plain_codec.decode(&sealed.bytes),
            Err(Error::Encryption(_))
        ));
    }

    #[test]
    fn test_deserialize_type_mismatch_is_encoding_error() {
        let codec = codec(1024);
        let plain = codec.serialize(&"just a string").unwrap();
        assert!(matches!(
            codec.deserialize::<User>(&plain),
            Err(Error::Encoding(_))
        ));
    }
}
