//! Configuration types for shardstore
//!
//! This module defines configuration structures used by the store and by
//! the driver binaries.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of worker shards (fixed for the lifetime of the store)
    pub shards: usize,
    /// Page size of the sparse data store (bytes, power of two)
    pub page_size: usize,
    /// Name prefix for shard worker threads
    pub thread_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            page_size: 4096,
            thread_name: "shard".to_string(),
        }
    }
}

impl StoreConfig {
    /// Configuration with a fixed shard count and defaults elsewhere
    #[must_use]
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards,
            ..Self::default()
        }
    }

    /// Set the page size
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Check the configuration for values the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(Error::configuration("shard count must be positive"));
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "page size must be a positive power of two, got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

fn default_shards() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.store.shards >= 1);
        assert_eq!(config.store.page_size, 4096);
        assert_eq!(config.logging.level, "info");
        assert!(config.store.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(StoreConfig::with_shards(0).validate().is_err());
        assert!(StoreConfig::with_shards(2).page_size(3000).validate().is_err());
        assert!(StoreConfig::with_shards(2).page_size(512).validate().is_ok());
    }
}
