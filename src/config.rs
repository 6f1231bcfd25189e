//! Engine configuration

use crate::error::{MemoryError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Bounded exponential backoff for transient store and embedding failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each attempt
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }
}

/// Memory engine configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Directory holding `momentum.db`
    pub data_dir: PathBuf,
    /// Upper bound on parent hops when walking to a root
    pub max_root_hops: u32,
    /// Retry policy for embedding calls and idempotent store operations
    pub retry: RetryPolicy,
    /// Hits per category when searching the archive
    pub search_limit: usize,
    /// Dimension of the default hash embedding provider
    pub embedding_dimension: usize,
    /// SQLite pool size for on-disk stores
    pub max_connections: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./momentum_data"),
            max_root_hops: 10_000,
            retry: RetryPolicy::default(),
            search_limit: 5,
            embedding_dimension: 384,
            max_connections: 5,
        }
    }
}

impl MemoryConfig {
    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("momentum.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_root_hops == 0 {
            return Err(MemoryError::Configuration(
                "max_root_hops must be at least 1".into(),
            ));
        }
        if self.search_limit == 0 {
            return Err(MemoryError::Configuration(
                "search_limit must be at least 1".into(),
            ));
        }
        if self.embedding_dimension == 0 {
            return Err(MemoryError::Configuration(
                "embedding_dimension must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(MemoryError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for memory config
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MemoryConfig::default(),
        }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn max_root_hops(mut self, hops: u32) -> Self {
        self.config.max_root_hops = hops;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn search_limit(mut self, limit: usize) -> Self {
        self.config.search_limit = limit;
        self
    }

    pub fn embedding_dimension(mut self, dimension: usize) -> Self {
        self.config.embedding_dimension = dimension;
        self
    }

    pub fn max_connections(mut self, connections: u32) -> Self {
        self.config.max_connections = connections;
        self
    }

    pub fn build(self) -> Result<MemoryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MemoryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = MemoryConfigBuilder::new()
            .data_dir("/tmp/momentum-test")
            .max_root_hops(50)
            .search_limit(8)
            .retry(RetryPolicy::none())
            .build()
            .unwrap();

        assert_eq!(config.max_root_hops, 50);
        assert_eq!(config.search_limit, 8);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/momentum-test/momentum.db")
        );
    }

    #[test]
    fn zero_bounds_are_rejected() {
        assert!(MemoryConfigBuilder::new().max_root_hops(0).build().is_err());
        assert!(MemoryConfigBuilder::new().search_limit(0).build().is_err());
        assert!(MemoryConfigBuilder::new()
            .embedding_dimension(0)
            .build()
            .is_err());
    }
}
