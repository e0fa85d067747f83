//! Cache configuration for eager image caching and tile serving.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically. It is read once at startup: the eager-cache
//! ceiling feeds [`MemoryBudget::initialize`](crate::MemoryBudget::initialize)
//! and the tile settings are passed to every opened image.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default upper bound on the number of tiles held by one tile cache.
pub const DEFAULT_MAX_TILE_CACHE_CAPACITY: usize = 4096;

/// Default number of pool slots kept above the tile cache capacity (one chunk).
pub const DEFAULT_TILE_POOL_MARGIN: usize = 4;

const ENV_FULL_IMAGE_CACHE_MB: &str = "CUBEVIEW_FULL_IMAGE_CACHE_MB";
const ENV_MAX_TILE_CACHE_CAPACITY: &str = "CUBEVIEW_MAX_TILE_CACHE_CAPACITY";
const ENV_TILE_POOL_MARGIN: &str = "CUBEVIEW_TILE_POOL_MARGIN";

/// Configuration for the cache system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Requested ceiling for eager (full/cube) image caching, in megabytes.
    /// Zero disables eager caching; negative values are treated as zero.
    pub full_image_cache_mb: i64,
    /// Upper bound on the number of tiles in a tile cache
    pub max_tile_cache_capacity: usize,
    /// Extra buffer pool slots above the tile cache capacity
    pub tile_pool_margin: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            full_image_cache_mb: 0,
            max_tile_cache_capacity: DEFAULT_MAX_TILE_CACHE_CAPACITY,
            tile_pool_margin: DEFAULT_TILE_POOL_MARGIN,
        }
    }
}

impl CacheConfig {
    /// Sets the requested eager-cache ceiling in megabytes.
    pub fn with_full_image_cache_mb(mut self, mb: i64) -> Self {
        self.full_image_cache_mb = mb;
        self
    }

    /// Sets the maximum tile cache capacity.
    pub fn with_max_tile_cache_capacity(mut self, capacity: usize) -> Self {
        self.max_tile_cache_capacity = capacity;
        self
    }

    /// Sets the buffer pool margin.
    pub fn with_tile_pool_margin(mut self, margin: usize) -> Self {
        self.tile_pool_margin = margin;
        self
    }

    /// Returns the default configuration file path for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/cubeview/cache.toml
    /// - Linux: ~/.config/cubeview/cache.toml
    /// - Windows: %APPDATA%\cubeview\cache.toml
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("cubeview").join("cache.toml"),
            None => PathBuf::from("cubeview-cache.toml"),
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `CUBEVIEW_FULL_IMAGE_CACHE_MB`: eager-cache ceiling in MB (default: 0)
    /// - `CUBEVIEW_MAX_TILE_CACHE_CAPACITY`: tiles per tile cache (default: 4096)
    /// - `CUBEVIEW_TILE_POOL_MARGIN`: extra pool slots (default: 4)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields of this configuration from environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(mb) = env_value::<i64>(ENV_FULL_IMAGE_CACHE_MB)? {
            self.full_image_cache_mb = mb;
        }
        if let Some(capacity) = env_value::<usize>(ENV_MAX_TILE_CACHE_CAPACITY)? {
            self.max_tile_cache_capacity = capacity;
        }
        if let Some(margin) = env_value::<usize>(ENV_TILE_POOL_MARGIN)? {
            self.tile_pool_margin = margin;
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// full_image_cache_mb = 4096
    /// max_tile_cache_capacity = 4096
    /// tile_pool_margin = 4
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Ceiling for eager caching with negative requests clamped to zero.
    pub fn requested_full_image_cache_mb(&self) -> i64 {
        self.full_image_cache_mb.max(0)
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Malformed TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Configuration could not be rendered as TOML
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
