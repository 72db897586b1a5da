//! Storage layer error types.

use thiserror::Error;

use crate::storage::wal::Lsn;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch in WAL record at {lsn}")]
    ChecksumMismatch { lsn: Lsn },

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Cannot truncate WAL before {requested}: {referenced} is still referenced")]
    SegmentInUse { requested: Lsn, referenced: Lsn },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Page access out of bounds: offset {offset}, length {len}")]
    PageOutOfBounds { offset: usize, len: usize },

    #[error("Page cache is full: every frame is pinned")]
    CacheFull,

    #[error("Invalid LSN: {0}")]
    InvalidLsn(Lsn),
}

impl StorageError {
    /// True for errors that mean the on-disk state cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::ChecksumMismatch { .. } | StorageError::DataCorruption(_)
        )
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
