//! Runtime configuration for tiered-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every per-cache knob (size bound, TTL, eviction, tiers, promotion, dedup
//! threshold, single-flight limits) lives in [`CacheConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::evictor::EvictionPolicy;
use crate::cache::tiered::{PromotionStrategy, WritePolicy};
use crate::error::{CacheError, Result};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tiered-cache", about = "Unified tiered cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Background maintenance.
    pub maintenance: MaintenanceConfig,

    /// Remote backend used by multi-tier caches.
    pub remote: RemoteBackendConfig,

    /// Embedding provider used by semantic caches.
    pub embedding: EmbeddingConfig,

    /// Caches to create at startup.
    pub caches: Vec<CacheDefinition>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between expired-entry sweeps in seconds (0 = lazy purge only).
    pub purge_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 30,
        }
    }
}

/// Which remote store implementation backs multi-tier caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteBackendKind {
    /// Process-local stand-in for a networked key/value store.
    #[default]
    InMemory,
}

/// Remote backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    pub backend: RemoteBackendKind,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Vector dimensionality of the hashing embedder.
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

/// Cache variant created by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKind {
    Basic,
    MultiTier,
    SingleFlight,
    Semantic,
}

/// A cache to create at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefinition {
    pub kind: CacheKind,

    #[serde(flatten)]
    pub config: CacheConfig,
}

/// Configuration of one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Unique name within a registry.
    pub name: String,

    /// Entry-count bound of the nearest memory tier.
    pub max_size: usize,

    /// TTL applied when a write gives none (None = no expiry).
    pub default_ttl_secs: Option<f64>,

    /// Eviction policy for memory tiers.
    pub eviction_policy: EvictionPolicy,

    /// zstd-compress payloads sent to the remote tier.
    pub enable_compression: bool,

    /// Accepted and logged; no cipher is applied.
    pub enable_encryption: bool,

    /// Largest serialized payload accepted by `set`.
    pub max_entry_bytes: usize,

    /// Tier layout.
    pub tiers: TierConfig,

    /// When values found in farther tiers are copied into nearer ones.
    pub promotion_strategy: PromotionStrategy,

    /// Which tiers a write reaches.
    pub write_policy: WritePolicy,

    /// Require `delete_pattern` support from every tier.
    pub pattern_delete: bool,

    /// Minimum cosine similarity treated as a duplicate (semantic caches).
    pub similarity_threshold: f32,

    /// Single-flight limits.
    pub single_flight: SingleFlightConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_size: 10_000,
            default_ttl_secs: None,
            eviction_policy: EvictionPolicy::Lru,
            enable_compression: false,
            enable_encryption: false,
            max_entry_bytes: 16 * 1024 * 1024, // 16 MiB
            tiers: TierConfig::default(),
            promotion_strategy: PromotionStrategy::OnHit,
            write_policy: WritePolicy::WriteThrough,
            pattern_delete: true,
            similarity_threshold: 0.95,
            single_flight: SingleFlightConfig::default(),
        }
    }
}

/// Tier layout: one memory tier plus an optional remote tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub memory: MemoryTierConfig,
    pub remote: Option<RemoteTierConfig>,
}

/// Memory tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Overrides `CacheConfig::max_size` for this tier.
    pub max_size: Option<usize>,

    /// Number of lock shards.
    pub shards: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            shards: 16,
        }
    }
}

/// Remote tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    /// Namespace prefix for keys in the shared remote store (default "<name>:").
    pub key_prefix: Option<String>,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            key_prefix: None,
            timeout_ms: 250,
        }
    }
}

/// Single-flight settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFlightConfig {
    /// Maximum distinct keys computing at once.
    pub max_concurrent: usize,

    /// Default wait timeout in milliseconds (None = wait forever).
    pub timeout_ms: Option<u64>,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            timeout_ms: None,
        }
    }
}

impl CacheConfig {
    /// Config with the given name and defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Check the configuration, reporting the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "cache name must not be empty".into(),
            ));
        }
        if self.name.contains(['*', '?', '[', ']']) {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache name {:?} must not contain glob metacharacters",
                self.name
            )));
        }
        if self.memory_max_size() == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache {}: max_size must be at least 1",
                self.name
            )));
        }
        if self.tiers.memory.shards == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache {}: memory tier needs at least one shard",
                self.name
            )));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache {}: similarity_threshold {} outside (0, 1]",
                self.name, self.similarity_threshold
            )));
        }
        if self.single_flight.max_concurrent == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache {}: single_flight.max_concurrent must be at least 1",
                self.name
            )));
        }
        if let Some(ttl) = self.default_ttl_secs {
            if let Err(e) = Duration::try_from_secs_f64(ttl) {
                return Err(CacheError::InvalidConfiguration(format!(
                    "cache {}: default_ttl_secs {ttl} is not a valid duration: {e}",
                    self.name
                )));
            }
        }
        if let Some(prefix) = self
            .tiers
            .remote
            .as_ref()
            .and_then(|remote| remote.key_prefix.as_deref())
        {
            if prefix.contains(['*', '?', '[', ']']) {
                return Err(CacheError::InvalidConfiguration(format!(
                    "cache {}: remote key_prefix {prefix:?} must not contain glob metacharacters",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Effective entry bound of the memory tier.
    pub fn memory_max_size(&self) -> usize {
        self.tiers.memory.max_size.unwrap_or(self.max_size)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn flight_timeout(&self) -> Option<Duration> {
        self.single_flight.timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CacheConfig::named("users");
        assert_eq!(cfg.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(cfg.similarity_threshold, 0.95);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CacheConfig::default().validate().is_err());

        let mut cfg = CacheConfig::named("bills");
        cfg.similarity_threshold = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));

        let mut cfg = CacheConfig::named("bills");
        cfg.max_size = 0;
        assert!(cfg.validate().is_err());

        assert!(CacheConfig::named("bill:*").validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unrepresentable_ttl() {
        let mut cfg = CacheConfig::named("bills");
        cfg.default_ttl_secs = Some(1e20);
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.default_ttl(), None);

        cfg.default_ttl_secs = Some(f64::NAN);
        assert!(cfg.validate().is_err());

        cfg.default_ttl_secs = Some(1e19);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_glob_key_prefix() {
        let mut cfg = CacheConfig::named("bills");
        cfg.tiers.remote = Some(RemoteTierConfig {
            key_prefix: Some("bills*".into()),
            ..Default::default()
        });
        assert!(matches!(
            cfg.validate(),
            Err(CacheError::InvalidConfiguration(_))
        ));

        cfg.tiers.remote = Some(RemoteTierConfig {
            key_prefix: Some("tenant-1:bills:".into()),
            ..Default::default()
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_cache_definitions() {
        let json = r#"{
            "caches": [
                { "kind": "basic", "name": "sessions", "max_size": 100, "eviction_policy": "lfu" },
                { "kind": "multi-tier", "name": "bills", "promotion_strategy": "on-miss",
                  "tiers": { "remote": { "timeout_ms": 50 } } }
            ]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.caches.len(), 2);
        assert_eq!(cfg.caches[0].kind, CacheKind::Basic);
        assert_eq!(cfg.caches[0].config.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(cfg.caches[1].config.promotion_strategy, PromotionStrategy::OnMiss);
        assert_eq!(cfg.caches[1].config.tiers.remote.as_ref().unwrap().timeout_ms, 50);
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_default_ttl_zero_means_none() {
        let mut cfg = CacheConfig::named("x");
        cfg.default_ttl_secs = Some(0.0);
        assert_eq!(cfg.default_ttl(), None);
        cfg.default_ttl_secs = Some(1.5);
        assert_eq!(cfg.default_ttl(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{ "server": { "listen": "127.0.0.1:9000" },
                 "caches": [ { "kind": "single-flight", "name": "reports" } ] }"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.caches[0].kind, CacheKind::SingleFlight);

        let missing = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(missing.caches.is_empty());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
