use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, StashError};

/// Top-level configuration for the storage system.
///
/// Loaded from a TOML file by the embedding application. Each section
/// covers one store or cross-cutting concern; every section and every
/// field has a default so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StashConfig {
    #[serde(default)]
    pub roots: RootsConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            roots: RootsConfig::default(),
            kv: KvConfig::default(),
            secrets: SecretsConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl StashConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StashConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| StashError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// Storage root directories.
///
/// The embedder supplies concrete platform paths: `durable_dir` should map
/// to the backed-up app-data area, `cache_dir` to the purgeable cache area.
/// `legacy_dir` points at the pre-namespacing layout that the migration
/// engine drains; it may not exist, in which case migration is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    /// Backed-up app-data directory (database, durable files, KV blobs).
    pub durable_dir: String,
    /// Purgeable cache directory (swept after the retention window).
    pub cache_dir: String,
    /// Legacy flat-layout directory drained by the migration engine.
    pub legacy_dir: String,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            durable_dir: "data".to_string(),
            cache_dir: "cache".to_string(),
            legacy_dir: "legacy".to_string(),
        }
    }
}

/// Key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Serialized payloads larger than this many bytes are routed to the
    /// large-value backend.
    pub large_value_threshold: usize,
    /// Keys carrying this prefix are always routed to the large-value
    /// backend, regardless of payload size.
    pub large_key_prefix: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            large_value_threshold: 1_048_576,
            large_key_prefix: "blob:".to_string(),
        }
    }
}

/// Secret store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Service name under which secrets are registered in the OS keyring.
    pub service: String,
    /// Force the in-memory session backend even on platforms with an OS
    /// keyring (useful for tests and headless environments).
    pub force_session: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            service: "stash".to_string(),
            force_session: false,
        }
    }
}

/// Cache retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache entries older than this many days are deleted by the sweep.
    pub retention_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}
