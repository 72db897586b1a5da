//! Storage layer implementation for vibewal.
//!
//! This module provides the durable foundation the recovery engine works on:
//!
//! - **Page**: Fixed-size (8KB) blocks ending in an LSN trailer
//! - **PageManager**: Handles reading/writing pages of the data files
//! - **PageCache**: In-memory cache of pages with pluggable eviction, dirty
//!   page tracking and the WAL rule on write-back
//! - **WAL**: Segmented write-ahead log with checksummed records

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{PageCache, PageGuard};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{FileId, PageBuf, PageId, PAGE_PAYLOAD_SIZE};
