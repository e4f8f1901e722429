//! Index and buffer pool configuration.

use crate::{Result, StorageError};

/// Default page size (16 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest page size an index can be created with.
pub const MIN_PAGE_SIZE: usize = 256;

/// Largest page size an index can be created with. Record offsets are u16.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Eviction policy used by the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacerKind {
    #[default]
    Lru,
    Clock,
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of frames in the pool.
    pub capacity: usize,
    /// Replacement policy.
    pub replacer: ReplacerKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            replacer: ReplacerKind::Lru,
        }
    }
}

/// Configuration for a B+Tree index file.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Page size in bytes; fixed for the lifetime of the index file.
    pub page_size: usize,
    /// Route page I/O through a buffer pool. `None` reads and writes pages
    /// directly against the index file.
    pub pool: Option<PoolConfig>,
    /// Free-to-capacity ratio above which a page tries to merge with a
    /// sibling after an erase.
    pub merge_threshold: f64,
    /// fsync the index file when it is closed.
    pub sync_on_close: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool: Some(PoolConfig::default()),
            merge_threshold: 0.8,
            sync_on_close: true,
        }
    }
}

impl IndexConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn without_pool(mut self) -> Self {
        self.pool = None;
        self
    }

    pub fn with_merge_threshold(mut self, merge_threshold: f64) -> Self {
        self.merge_threshold = merge_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }

        if self.page_size % 8 != 0 {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} is not a multiple of 8",
                self.page_size
            )));
        }

        if !(self.merge_threshold > 0.0 && self.merge_threshold < 1.0) {
            return Err(StorageError::InvalidConfig(format!(
                "merge threshold {} must lie strictly between 0 and 1",
                self.merge_threshold
            )));
        }

        if let Some(pool) = &self.pool {
            if pool.capacity < 2 {
                return Err(StorageError::InvalidConfig(format!(
                    "buffer pool needs at least 2 frames, got {}",
                    pool.capacity
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IndexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.pool.as_ref().map(|p| p.replacer), Some(ReplacerKind::Lru));
    }

    #[test]
    fn test_rejects_bad_page_sizes() {
        assert!(IndexConfig::default().with_page_size(128).validate().is_err());
        assert!(IndexConfig::default().with_page_size(64 * 1024).validate().is_err());
        assert!(IndexConfig::default().with_page_size(1001).validate().is_err());
        assert!(IndexConfig::default().with_page_size(512).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_threshold_and_pool() {
        assert!(IndexConfig::default().with_merge_threshold(1.5).validate().is_err());
        let tiny_pool = PoolConfig {
            capacity: 1,
            ..PoolConfig::default()
        };
        assert!(IndexConfig::default().with_pool(tiny_pool).validate().is_err());
    }
}
