//! Cache configuration and builder.
//!
//! ## Example
//!
//! ```rust
//! use cachedir::CacheBuilder;
//! use cachedir::persist::Version;
//!
//! let cache = CacheBuilder::new()
//!     .shards(8)
//!     .capacity(10_000)
//!     .max_bytes(64 << 20)
//!     .object_version(Version::new(2, 1))
//!     .try_build()
//!     .unwrap();
//! assert_eq!(cache.shard_count(), 8);
//! ```

use crate::cache::DirCache;
use crate::error::ConfigError;
use crate::persist::Version;

/// Validated cache parameters.
///
/// Entry and byte budgets are totals; each shard gets `ceil(total / shards)`,
/// so a skewed key distribution can fill one shard before the total is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of independently locked key-space partitions.
    pub shards: usize,
    /// Hard limit on allocated entries (Building and Removing included).
    pub capacity: Option<usize>,
    /// Hard limit on resident payload bytes.
    pub max_bytes: Option<usize>,
    /// Version of the payload format, written to and checked against segments.
    pub object_version: Version,
    /// Seed for shard selection.
    pub shard_seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self {
            shards,
            capacity: None,
            max_bytes: None,
            object_version: Version::new(1, 0),
            shard_seed: 0,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::new("shards must be > 0"));
        }
        if self.shards > u32::MAX as usize {
            return Err(ConfigError::new("shards must fit in u32"));
        }
        if let Some(capacity) = self.capacity {
            if capacity == 0 {
                return Err(ConfigError::new("capacity must be > 0"));
            }
            if capacity < self.shards {
                return Err(ConfigError::new(format!(
                    "capacity ({capacity}) must be >= shards ({})",
                    self.shards
                )));
            }
        }
        if self.max_bytes == Some(0) {
            return Err(ConfigError::new("max_bytes must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn per_shard_capacity(&self) -> Option<usize> {
        self.capacity.map(|total| total.div_ceil(self.shards))
    }

    pub(crate) fn per_shard_bytes(&self) -> Option<usize> {
        self.max_bytes.map(|total| total.div_ceil(self.shards))
    }
}

/// Builder for [`DirCache`].
#[derive(Debug, Clone, Default)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl CacheBuilder {
    /// Starts from [`CacheConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = Some(capacity);
        self
    }

    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.config.max_bytes = Some(max_bytes);
        self
    }

    pub fn object_version(mut self, version: Version) -> Self {
        self.config.object_version = version;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.shard_seed = seed;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Validates the configuration and builds the cache.
    pub fn try_build(self) -> Result<DirCache, ConfigError> {
        DirCache::new(self.config)
    }
}
