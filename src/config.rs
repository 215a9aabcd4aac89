//! Device configuration
//!
//! Configuration is plain serde data so it can be loaded from a TOML file
//! and overridden from the command line:
//!
//! ```toml
//! disksize = 268435456
//! compression = "zstd"
//! compression_level = 3
//! max_zpage_size = 4095
//! reclaim_on_io = true
//!
//! [pool]
//! min_class_size = 32
//! slots_per_chunk = 64
//! max_bytes = 134217728
//! ```

use crate::error::{Error, Result};
use crate::storage::compression::CompressionAlgorithm;
use crate::storage::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Pages that compress to more than this are stored uncompressed.
///
/// By default anything smaller than a page is kept compressed.
pub const DEFAULT_MAX_ZPAGE_SIZE: usize = PAGE_SIZE - 1;

/// Stricter threshold that stores pages raw unless compression saves a
/// quarter of the page; trades memory for cheaper reads.
pub const STRICT_MAX_ZPAGE_SIZE: usize = PAGE_SIZE / 4 * 3;

/// Default disk size as a percentage of physical RAM.
pub const DEFAULT_DISKSIZE_PERC_RAM: u64 = 25;

/// Configuration for a single compressed block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Uncompressed capacity in bytes (0 = 25% of physical RAM)
    pub disksize: u64,
    /// Page compressor
    pub compression: CompressionAlgorithm,
    /// Compression level (zstd only)
    pub compression_level: i32,
    /// Largest compressed size still worth storing compressed
    pub max_zpage_size: usize,
    /// Drain pending slot frees at the start of every read/write
    pub reclaim_on_io: bool,
    /// Object pool settings
    pub pool: PoolConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disksize: 0,
            compression: CompressionAlgorithm::Zstd,
            compression_level: 3,
            max_zpage_size: DEFAULT_MAX_ZPAGE_SIZE,
            reclaim_on_io: true,
            pool: PoolConfig::default(),
        }
    }
}

/// Object pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Smallest size class (bytes)
    pub min_class_size: usize,
    /// Number of objects per backing chunk
    pub slots_per_chunk: usize,
    /// Upper bound on memory held by the pool (None = unlimited)
    pub max_bytes: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_class_size: 32,
            slots_per_chunk: 64,
            max_bytes: None,
        }
    }
}

impl DeviceConfig {
    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        info!(path = ?path, "Loaded device configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.max_zpage_size == 0 || self.max_zpage_size >= PAGE_SIZE {
            return Err(Error::Config(format!(
                "max_zpage_size must be in 1..{}, got {}",
                PAGE_SIZE, self.max_zpage_size
            )));
        }
        if self.pool.min_class_size == 0 || self.pool.min_class_size > PAGE_SIZE {
            return Err(Error::Config(format!(
                "pool.min_class_size must be in 1..={}, got {}",
                PAGE_SIZE, self.pool.min_class_size
            )));
        }
        if self.pool.slots_per_chunk == 0 {
            return Err(Error::Config(
                "pool.slots_per_chunk must be at least 1".to_string(),
            ));
        }
        self.compression.validate_level(self.compression_level)
    }
}
