pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageBuf, PageId};
use crate::storage::wal::{Lsn, WalManager};
use crate::storage::PageManager;
use dashmap::DashMap;
use log::trace;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub struct Frame {
    page_id: PageId,
    data: RwLock<PageBuf>,
    /// Only changed while the pool state lock is held.
    pin_count: AtomicU32,
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    frames: HashMap<FrameId, Arc<Frame>>,
    replacer: Box<dyn Replacer>,
    next_frame_id: FrameId,
}

/// Page cache shared by the atomic operation manager, recovery and
/// checkpoints.
///
/// Dirty pages are tracked together with their recovery LSN, the LSN of the
/// first logged change that dirtied them. A dirty page is written back only
/// after the WAL is durable up to the page's LSN.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<PageCacheInner>,
}

struct PageCacheInner {
    state: Mutex<PoolState>,
    dirty_pages: DashMap<PageId, Lsn>,
    page_manager: Mutex<PageManager>,
    wal: Arc<WalManager>,
    capacity: usize,
}

impl PageCache {
    pub fn new(
        page_manager: PageManager,
        replacer: Box<dyn Replacer>,
        capacity: usize,
        wal: Arc<WalManager>,
    ) -> Self {
        Self {
            inner: Arc::new(PageCacheInner {
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(capacity),
                    frames: HashMap::with_capacity(capacity),
                    replacer,
                    next_frame_id: 0,
                }),
                dirty_pages: DashMap::new(),
                page_manager: Mutex::new(page_manager),
                wal,
                capacity,
            }),
        }
    }

    /// Pins a page, loading it from disk if needed. The page stays in the
    /// cache until the returned guard is dropped.
    pub fn pin(&self, page_id: PageId) -> StorageResult<PageGuard> {
        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if let Some(frame) = state.frames.get(&frame_id).cloned() {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                state.replacer.pin(frame_id);
                return Ok(self.guard(frame_id, frame));
            }
        }

        let frame_id = self.free_frame(&mut state)?;

        let mut buf = PageBuf::zeroed();
        self.inner
            .page_manager
            .lock()
            .read_page(page_id, buf.as_bytes_mut())?;

        let frame = Arc::new(Frame {
            page_id,
            data: RwLock::new(buf),
            pin_count: AtomicU32::new(1),
        });
        state.frames.insert(frame_id, Arc::clone(&frame));
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(self.guard(frame_id, frame))
    }

    fn guard(&self, frame_id: FrameId, frame: Arc<Frame>) -> PageGuard {
        PageGuard {
            cache: self.clone(),
            frame_id,
            frame,
        }
    }

    /// Finds a frame id for a new page, evicting an unpinned page when the
    /// cache is full.
    fn free_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if state.frames.len() < self.inner.capacity {
            let frame_id = state.next_frame_id;
            state.next_frame_id += 1;
            return Ok(frame_id);
        }

        let victim_id = state.replacer.evict().ok_or(StorageError::CacheFull)?;
        let victim = match state.frames.remove(&victim_id) {
            Some(victim) => victim,
            None => return Ok(victim_id),
        };
        state.page_table.remove(&victim.page_id);

        if let Err(e) = self.write_back(&victim) {
            state.page_table.insert(victim.page_id, victim_id);
            state.frames.insert(victim_id, victim);
            state.replacer.unpin(victim_id);
            return Err(e);
        }
        trace!("Evicted page {} from frame {}", victim.page_id, victim_id);
        Ok(victim_id)
    }

    /// Writes a frame to disk if it is dirty, honouring the WAL rule.
    ///
    /// The page stays in the dirty table until its image is on disk, so a
    /// concurrent `flush_dirty_before` still finds it and waits for the frame.
    fn write_back(&self, frame: &Frame) -> StorageResult<()> {
        let image = {
            let data = frame.data.read();
            if !self.inner.dirty_pages.contains_key(&frame.page_id) {
                return Ok(());
            }
            data.clone()
        };

        self.inner.wal.flush(image.lsn())?;
        self.inner
            .page_manager
            .lock()
            .write_page(frame.page_id, image.as_bytes())?;

        // Writers stamp and mark dirty under the frame lock, so an unchanged
        // LSN means nothing was applied after the image was taken.
        let data = frame.data.read();
        if data.lsn() == image.lsn() {
            self.inner.dirty_pages.remove(&frame.page_id);
        }
        Ok(())
    }

    /// Records that `page_id` was changed by the record at `lsn`. The first
    /// such LSN since the page was last clean is kept as its recovery LSN.
    pub fn mark_dirty(&self, page_id: PageId, lsn: Lsn) {
        self.inner.dirty_pages.entry(page_id).or_insert(lsn);
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.inner.dirty_pages.contains_key(&page_id)
    }

    /// Snapshot of dirty pages and their recovery LSNs, ordered by page.
    pub fn dirty_page_table(&self) -> Vec<(PageId, Lsn)> {
        let mut table: Vec<_> = self
            .inner
            .dirty_pages
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        table.sort_unstable();
        table
    }

    /// Writes back every page first dirtied before `cutoff`. Returns the
    /// number of pages examined.
    pub fn flush_dirty_before(&self, cutoff: Lsn) -> StorageResult<usize> {
        let pages: Vec<PageId> = self
            .inner
            .dirty_pages
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| *entry.key())
            .collect();
        self.flush_pages(&pages)?;
        Ok(pages.len())
    }

    /// Writes back every dirty page.
    pub fn flush_all(&self) -> StorageResult<()> {
        let pages: Vec<PageId> = self
            .inner
            .dirty_pages
            .iter()
            .map(|entry| *entry.key())
            .collect();
        self.flush_pages(&pages)?;
        self.inner.page_manager.lock().sync_all()
    }

    fn flush_pages(&self, pages: &[PageId]) -> StorageResult<()> {
        for &page_id in pages {
            // Pinned so that the frame cannot be evicted mid-write.
            let guard = self.pin(page_id)?;
            self.write_back(&guard.frame)?;
        }
        Ok(())
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.state.lock().page_table.contains_key(&page_id)
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.inner.wal
    }

    fn unpin(&self, frame_id: FrameId, frame: &Frame) {
        let mut state = self.inner.state.lock();
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.replacer.unpin(frame_id);
        }
    }
}

/// A pinned page. Dropping the guard unpins it.
pub struct PageGuard {
    cache: PageCache,
    frame_id: FrameId,
    frame: Arc<Frame>,
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        self.frame.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.frame.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.frame.data.write()
    }

    pub fn page_lsn(&self) -> Lsn {
        self.frame.data.read().lsn()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.cache.unpin(self.frame_id, &self.frame);
    }
}
