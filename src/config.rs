//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::wal::{WalConfig, MAX_SEGMENT_SIZE};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("WAL segment size {0} is outside 1..={max}", max = MAX_SEGMENT_SIZE)]
    InvalidSegmentSize(u64),

    #[error("Page cache capacity must be at least 1")]
    ZeroCacheCapacity,

    #[error("WAL buffer size must be at least 1")]
    ZeroBufferSize,

    #[error("Checkpoint interval must be positive")]
    ZeroCheckpointInterval,
}

/// Page cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of page frames.
    pub capacity: usize,
    /// Whether page write-back fsyncs the data file.
    pub fsync: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 1024,
            fsync: true,
        }
    }
}

/// Background checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// How often the background checkpointer runs; `None` disables it.
    pub interval: Option<Duration>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Configuration of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory; holds the page files, the log and the checkpoint marker.
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    pub cache: CacheConfig,
    pub checkpoint: CheckpointConfig,
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`, with the log in
    /// `data_dir/wal`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        EngineConfig {
            wal: WalConfig {
                wal_dir: data_dir.join("wal"),
                ..Default::default()
            },
            cache: CacheConfig::default(),
            checkpoint: CheckpointConfig::default(),
            data_dir,
        }
    }

    /// Directory holding the page files.
    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wal.max_segment_size == 0 || self.wal.max_segment_size > MAX_SEGMENT_SIZE {
            return Err(ConfigError::InvalidSegmentSize(self.wal.max_segment_size));
        }
        if self.wal.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.checkpoint.interval == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroCheckpointInterval);
        }
        Ok(())
    }
}
