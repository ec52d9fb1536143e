//! Engine configuration, loaded from TOML or JSON.

use std::path::Path;

use dedupfs_reduce::{CompressionConfig, DigestAlgorithm, PoolConfig};
use serde::{Deserialize, Serialize};

use crate::attr_cache::AttrCacheConfig;
use crate::block_cache::CacheConfig;
use crate::error::{MetaError, MetaResult};
use crate::gc::GcConfig;
use crate::hash_store::StoreConfig;
use crate::logging::{self, LoggingConfig};

/// Everything needed to open an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block size, digest, layout, mount mode
    pub store: StoreConfig,
    /// Codec policy for novel blocks
    pub compression: CompressionConfig,
    /// Block cache bounds and sweep intervals
    pub cache: CacheConfig,
    /// Attribute cache
    pub attr_cache: AttrCacheConfig,
    /// Garbage collection schedule
    pub gc: GcConfig,
    /// Compression worker pool
    pub pool: PoolConfig,
    /// Log output, installed by [`crate::Engine::open`] when `logging.install` is set
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> MetaResult<()> {
        if self.store.block_size == 0 {
            return Err(MetaError::Config("store.block_size must be positive".to_string()));
        }
        self.store
            .digest
            .parse::<DigestAlgorithm>()
            .map_err(|e| MetaError::Config(e.to_string()))?;
        if self.store.subvolume.is_empty() {
            return Err(MetaError::Config("store.subvolume must not be empty".to_string()));
        }
        let ratio = self.compression.minimal_ratio;
        if ratio.is_nan() || ratio <= 0.0 {
            return Err(MetaError::Config(format!(
                "compression.minimal_ratio must be positive, got {}",
                ratio
            )));
        }
        if self.gc.page_size == 0 {
            return Err(MetaError::Config("gc.page_size must be positive".to_string()));
        }
        logging::validate(&self.logging)?;
        Ok(())
    }
}
