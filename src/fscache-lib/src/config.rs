use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{CacheError, CacheResult};

fn default_capacity_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_part_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_block_bytes() -> u64 {
    64 * 1024
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_merge_gap_blocks() -> u64 {
    4
}

/// Runtime configuration for one cache instance, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
    pub remote_base_url: String,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    #[serde(default = "default_part_bytes")]
    pub part_bytes: u64,
    #[serde(default = "default_block_bytes")]
    pub block_bytes: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_merge_gap_blocks")]
    pub merge_gap_blocks: u64,
}

impl CacheConfig {
    pub fn new(cache_root: PathBuf, remote_base_url: String) -> Self {
        Self {
            cache_root,
            remote_base_url,
            capacity_bytes: default_capacity_bytes(),
            part_bytes: default_part_bytes(),
            block_bytes: default_block_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            merge_gap_blocks: default_merge_gap_blocks(),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(CacheError::InvalidParam("cache_root is empty".to_string()));
        }
        if self.remote_base_url.is_empty() {
            return Err(CacheError::InvalidParam(
                "remote_base_url is empty".to_string(),
            ));
        }
        if self.block_bytes == 0 || self.part_bytes == 0 {
            return Err(CacheError::InvalidParam(
                "part_bytes and block_bytes must be non-zero".to_string(),
            ));
        }
        if self.part_bytes % self.block_bytes != 0 {
            return Err(CacheError::InvalidParam(format!(
                "part_bytes {} is not a multiple of block_bytes {}",
                self.part_bytes, self.block_bytes
            )));
        }
        Ok(())
    }

    pub fn blocks_per_part(&self) -> u64 {
        self.part_bytes / self.block_bytes
    }
}
