//! Error types for the tiered cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Operation Errors
    // =========================================================================
    /// Value could not be serialized or deserialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Remote store unreachable or timed out
    #[error("Remote tier unavailable: {0}")]
    RemoteUnavailable(String),

    /// Local tier write rejected after eviction attempts
    #[error("Local tier capacity exceeded: entry of {size} bytes does not fit in {limit} bytes")]
    CapacityExceeded { size: u64, limit: u64 },

    /// Option validation failed before any tier was touched
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Warmup strategy loader failed
    #[error("Warmup strategy '{strategy}' failed: {reason}")]
    Warmup { strategy: String, reason: String },

    /// Caller-supplied computation in `wrap` failed
    #[error("Compute function failed: {0}")]
    Compute(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means the remote tier should be treated as absent
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }

    /// Shorthand for a compute failure from any displayable error
    pub fn compute(err: impl std::fmt::Display) -> Self {
        Error::Compute(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::RemoteUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_unavailable_detection() {
        assert!(Error::RemoteUnavailable("down".into()).is_remote_unavailable());
        assert!(!Error::Encoding("bad".into()).is_remote_unavailable());
    }

    #[test]
    fn test_json_error_maps_to_encoding() {
        let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_capacity_message() {
        let err = Error::CapacityExceeded { size: 10, limit: 5 };
        assert_eq!(
            err.to_string(),
            "Local tier capacity exceeded: entry of 10 bytes does not fit in 5 bytes"
        );
    }
}
