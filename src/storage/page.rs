//! Page identifiers and the in-memory page buffer.
//!
//! Every page ends with an 8-byte trailer holding the LSN of the last logged
//! change applied to it. Only the payload area in front of the trailer is
//! reachable through the bounds-checked accessors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::Lsn;
use crate::storage::PAGE_SIZE;

/// Size of the page LSN trailer.
pub const PAGE_LSN_SIZE: usize = 8;

/// Bytes of a page available to clients.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_LSN_SIZE;

/// Identifier of a paginated data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// A page address: data file plus page index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub file_id: FileId,
    pub page_index: u32,
}

impl PageId {
    pub fn new(file_id: u32, page_index: u32) -> Self {
        Self {
            file_id: FileId(file_id),
            page_index,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id.0, self.page_index)
    }
}

/// Checks that `[offset, offset + len)` lies inside the payload area.
pub fn check_bounds(offset: usize, len: usize) -> StorageResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_PAYLOAD_SIZE => Ok(()),
        _ => Err(StorageError::PageOutOfBounds { offset, len }),
    }
}

/// A page-sized buffer owned by the page cache.
#[derive(Clone)]
pub struct PageBuf {
    data: Box<[u8; PAGE_SIZE]>,
}

impl PageBuf {
    pub fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// The whole page image, trailer included.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Reads `len` payload bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> StorageResult<&[u8]> {
        check_bounds(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Overwrites payload bytes starting at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        check_bounds(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// LSN of the last change applied to this page.
    pub fn lsn(&self) -> Lsn {
        let mut raw = [0u8; PAGE_LSN_SIZE];
        raw.copy_from_slice(&self.data[PAGE_PAYLOAD_SIZE..]);
        Lsn::from_u64(u64::from_le_bytes(raw))
    }

    /// Stamps the page LSN. The stamp never moves backwards.
    pub fn stamp_lsn(&mut self, lsn: Lsn) {
        if lsn > self.lsn() {
            self.data[PAGE_PAYLOAD_SIZE..].copy_from_slice(&lsn.to_u64().to_le_bytes());
        }
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuf").field("lsn", &self.lsn()).finish()
    }
}
