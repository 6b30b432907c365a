//! Engine Configuration
//!
//! Typed view of the recognised configuration options. Field names are
//! camelCase on the wire so a YAML document reads `local.maxEntries`,
//! `remote.keyPrefix`, `compression.thresholdBytes` and so on.
//!
//! ```yaml
//! defaultTtlSeconds: 3600
//! maxTtlSeconds: 86400
//! local:
//!   maxEntries: 10000
//!   maxBytes: 67108864
//! remote:
//!   endpoint: redis://127.0.0.1:6379
//!   keyPrefix: "app:"
//! compression:
//!   enabled: true
//!   thresholdBytes: 1024
//! warmup:
//!   enabled: true
//!   strategies: [reference-data]
//! ```

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// AES-256 key size in bytes
pub const ENCRYPTION_KEY_SIZE: usize = 32;

// =============================================================================
// Component Configuration
// =============================================================================

/// Local (in-process) tier bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfig {
    /// Maximum number of resident entries
    pub max_entries: usize,
    /// Maximum aggregate size of resident entries in bytes
    pub max_bytes: u64,
    /// TTL applied to local entries when a write omits one (0 = no expiry)
    pub default_ttl_seconds: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024, // 64MB
            default_ttl_seconds: 300,
        }
    }
}

/// Remote (shared) tier location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Redis URL; `None` keeps the engine on an in-process remote store
    pub endpoint: Option<String>,
    /// Prefix prepended to every remote key for namespace isolation
    pub key_prefix: String,
    /// Per-operation timeout against the remote store
    pub operation_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_prefix: "cache:".to_string(),
            operation_timeout_ms: 2_000,
        }
    }
}

impl RemoteConfig {
    /// Operation timeout as a duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Global compression policy for remote payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionConfig {
    /// Compress payloads above the threshold unless a write forbids it
    pub enabled: bool,
    /// Payloads strictly larger than this are compressed
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024, // 1KB
            level: 4,
        }
    }
}

/// Opt-in payload encryption
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// Make encryption available to writes that request it
    pub enabled: bool,
    /// Base64-encoded 32-byte AES-256 key
    pub key: Option<String>,
}

impl EncryptionConfig {
    /// Decode the configured key, if encryption is enabled
    pub fn key_bytes(&self) -> Result<Option<[u8; ENCRYPTION_KEY_SIZE]>> {
        if !self.enabled {
            return Ok(None);
        }

        let encoded = self
            .key
            .as_deref()
            .ok_or_else(|| Error::Config("encryption.enabled requires encryption.key".into()))?;

        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("encryption.key is not valid base64: {e}")))?;

        let key: [u8; ENCRYPTION_KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            Error::Config(format!(
                "encryption.key must decode to {ENCRYPTION_KEY_SIZE} bytes, got {}",
                raw.len()
            ))
        })?;

        Ok(Some(key))
    }
}

/// A warmup strategy declared in configuration with literal entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeedStrategyConfig {
    pub name: String,
    pub priority: i32,
    pub ttl_seconds: Option<i64>,
    pub tags: Vec<String>,
    pub namespace: Option<String>,
    pub entries: Vec<SeedEntry>,
}

/// One key/value pair of a seed strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntry {
    pub key: String,
    pub value: serde_json::Value,
}

/// Startup warmup settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WarmupConfig {
    /// Run the named strategies when the engine starts
    pub enabled: bool,
    /// Strategy names to run at startup (empty = every registered strategy)
    pub strategies: Vec<String>,
    /// Strategies defined inline in configuration
    pub seeds: Vec<SeedStrategyConfig>,
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    /// TTL used when a write omits one (0 = no expiry)
    pub default_ttl_seconds: u64,
    /// Upper clamp for every TTL (0 = unbounded)
    pub max_ttl_seconds: u64,
    pub warmup: WarmupConfig,
    /// Coalesce concurrent `wrap` computations for the same key
    pub single_flight: bool,
    /// Permit `clear` without a pattern (keep off in production)
    pub allow_full_clear: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
            default_ttl_seconds: 3_600,
            max_ttl_seconds: 86_400,
            warmup: WarmupConfig::default(),
            single_flight: false,
            allow_full_clear: false,
        }
    }
}

impl CacheConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.local.max_entries == 0 {
            return Err(Error::Config("local.maxEntries must be greater than 0".into()));
        }
        if self.local.max_bytes == 0 {
            return Err(Error::Config("local.maxBytes must be greater than 0".into()));
        }
        if self.remote.key_prefix.is_empty() {
            return Err(Error::Config("remote.keyPrefix must not be empty".into()));
        }
        if self.max_ttl_seconds > 0 && self.default_ttl_seconds > self.max_ttl_seconds {
            return Err(Error::Config(format!(
                "defaultTtlSeconds ({}) exceeds maxTtlSeconds ({})",
                self.default_ttl_seconds, self.max_ttl_seconds
            )));
        }
        // Surfaces a missing or malformed key at startup rather than on first write
        self.encryption.key_bytes()?;

        let mut seen = std::collections::HashSet::new();
        for seed in &self.warmup.seeds {
            if seed.name.is_empty() {
                return Err(Error::Config("warmup.seeds entries need a name".into()));
            }
            if !seen.insert(seed.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate warmup seed name '{}'",
                    seed.name
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.local.max_entries, 10_000);
        assert_eq!(config.remote.key_prefix, "cache:");
        assert!(!config.allow_full_clear);
    }

    #[test]
    fn test_yaml_uses_camel_case_names() {
        let yaml = r#"
defaultTtlSeconds: 60
maxTtlSeconds: 600
local:
  maxEntries: 5
  maxBytes: 4096
remote:
  endpoint: redis://localhost:6379
  keyPrefix: "svc:"
compression:
  thresholdBytes: 256
warmup:
  enabled: true
  strategies: [countries]
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.default_ttl_seconds, 60);
        assert_eq!(config.local.max_entries, 5);
        assert_eq!(config.local.max_bytes, 4096);
        assert_eq!(config.remote.endpoint.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.remote.key_prefix, "svc:");
        assert_eq!(config.compression.threshold_bytes, 256);
        assert!(config.compression.enabled);
        assert_eq!(config.warmup.strategies, vec!["countries".to_string()]);
    }

    #[test]
    fn test_default_above_max_rejected() {
        let config = CacheConfig {
            default_ttl_seconds: 100,
            max_ttl_seconds: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = CacheConfig::default();
        config.local.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encryption_requires_key() {
        let mut config = CacheConfig::default();
        config.encryption.enabled = true;
        assert!(config.validate().is_err());

        config.encryption.key = Some(BASE64.encode([7u8; ENCRYPTION_KEY_SIZE]));
        assert!(config.validate().is_ok());
        assert_eq!(config.encryption.key_bytes().unwrap(), Some([7u8; 32]));
    }

    #[test]
    fn test_short_encryption_key_rejected() {
        let config = EncryptionConfig {
            enabled: true,
            key: Some(BASE64.encode([1u8; 16])),
        };
        assert!(config.key_bytes().is_err());
    }

    #[test]
    fn test_seed_strategies_parse() {
        let yaml = r#"
warmup:
  seeds:
    - name: countries
      priority: 10
      tags: [reference]
      entries:
        - key: "country:pt"
          value: { name: "Portugal" }
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        let seed = &config.warmup.seeds[0];
        assert_eq!(seed.name, "countries");
        assert_eq!(seed.priority, 10);
        assert_eq!(seed.entries[0].key, "country:pt");
        assert_eq!(seed.entries[0].value["name"], "Portugal");
    }

    #[test]
    fn test_duplicate_seed_names_rejected() {
        let yaml = r#"
warmup:
  seeds:
    - name: a
    - name: a
"#;
        assert!(CacheConfig::from_yaml_str(yaml).is_err());
    }
}
