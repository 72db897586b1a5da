//! High-level engine interface that ties the log, the page cache, atomic
//! operations, recovery and checkpoints together.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::atomic::{AtomicOperation, AtomicOperationManager, FreezeGuard};
use crate::component::{ComponentId, ComponentRegistry};
use crate::config::EngineConfig;
use crate::recovery::{AriesRecovery, CheckpointManager, CheckpointMarker, Checkpointer, RecoveryStats};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::wal::{Lsn, PageDelta, PageOperation, WalManager};
use crate::storage::{PageCache, PageId, PageManager};

/// A recoverable storage engine instance.
///
/// Opening runs crash recovery. Dropping the engine without [`close`](Self::close)
/// leaves unflushed state behind exactly as a crash would; the next open
/// recovers it.
pub struct Engine {
    config: EngineConfig,
    atomic: Arc<AtomicOperationManager>,
    checkpoints: Arc<CheckpointManager>,
    checkpointer: Option<Checkpointer>,
    recovery_stats: RecoveryStats,
}

impl Engine {
    /// Opens the engine in `config.data_dir`, creating it if needed, and
    /// recovers whatever the previous run left behind.
    pub fn open(config: EngineConfig, components: ComponentRegistry) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

        let wal = Arc::new(
            WalManager::open(config.wal.clone()).context("Failed to open the write-ahead log")?,
        );
        let page_manager = PageManager::open(&config.pages_dir(), config.cache.fsync)
            .context("Failed to open the page files")?;
        let capacity = config.cache.capacity;
        let cache = PageCache::new(
            page_manager,
            Box::new(LruReplacer::new(capacity)),
            capacity,
            Arc::clone(&wal),
        );

        let marker = CheckpointMarker::read(&config.data_dir)
            .context("Failed to read the checkpoint marker")?;
        let recovery_stats = AriesRecovery::new(Arc::clone(&wal), cache.clone(), components.clone())
            .recover(marker.as_ref())
            .context("Crash recovery failed")?;

        let atomic = Arc::new(AtomicOperationManager::new(wal, cache, components));
        atomic.advance_ids_past(recovery_stats.max_unit_id);

        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&atomic),
            config.data_dir.clone(),
        ));
        checkpoints
            .checkpoint()
            .context("Checkpoint after recovery failed")?;

        let checkpointer = match config.checkpoint.interval {
            Some(interval) => Some(
                Checkpointer::start(Arc::clone(&checkpoints), interval)
                    .context("Failed to start the checkpointer")?,
            ),
            None => None,
        };

        info!(
            "Opened engine at {:?} ({} records analyzed, {} losers rolled back)",
            config.data_dir, recovery_stats.records_analyzed, recovery_stats.losers
        );
        Ok(Self {
            config,
            atomic,
            checkpoints,
            checkpointer,
            recovery_stats,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What recovery did when this engine was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    pub fn atomic(&self) -> &Arc<AtomicOperationManager> {
        &self.atomic
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        self.atomic.wal()
    }

    pub fn begin_operation(&self, metadata: Option<Vec<u8>>) -> Result<AtomicOperation> {
        Ok(self.atomic.begin(metadata)?)
    }

    /// Logs and applies a change of one page given both byte images.
    pub fn log_page_mutation(
        &self,
        op: &mut AtomicOperation,
        page_id: PageId,
        redo: PageDelta,
        undo: PageDelta,
    ) -> Result<Lsn> {
        let page_op = PageOperation::new(page_id, redo, undo)?;
        Ok(self.atomic.record_page_operation(op, page_op)?)
    }

    /// Writes `bytes` at `offset` of the page, capturing the bytes it
    /// replaces as the undo image. Concurrent writers of the same range must
    /// be serialized by the caller.
    pub fn write_page(
        &self,
        op: &mut AtomicOperation,
        page_id: PageId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<Lsn> {
        let redo = PageDelta::new(offset, bytes.to_vec())?;
        let before = self.read_page(page_id, offset, bytes.len())?;
        let undo = PageDelta::new(offset, before)?;
        self.log_page_mutation(op, page_id, redo, undo)
    }

    /// Logs a component operation and runs the component's redo.
    pub fn log_component_mutation(
        &self,
        op: &mut AtomicOperation,
        component_id: ComponentId,
        redo: Vec<u8>,
        undo: Vec<u8>,
    ) -> Result<Lsn> {
        Ok(self
            .atomic
            .record_component_operation(op, component_id, redo, undo)?)
    }

    pub fn commit(&self, op: &mut AtomicOperation) -> Result<()> {
        self.atomic
            .commit(op)
            .with_context(|| format!("Failed to commit {}", op.unit_id()))
    }

    pub fn rollback(&self, op: &mut AtomicOperation) -> Result<()> {
        self.atomic
            .rollback(op)
            .with_context(|| format!("Failed to roll back {}", op.unit_id()))
    }

    /// Runs `f` inside a new atomic operation, committing it when `f`
    /// succeeds and rolling it back otherwise.
    pub fn execute_inside<T, F>(&self, metadata: Option<Vec<u8>>, f: F) -> Result<T>
    where
        F: FnOnce(&Engine, &mut AtomicOperation) -> Result<T>,
    {
        self.atomic.execute_inside(metadata, |op| f(self, op))
    }

    /// Reads `len` bytes at `offset` of the page. Pages never written read
    /// as zeros.
    pub fn read_page(&self, page_id: PageId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let guard = self.atomic.cache().pin(page_id)?;
        let page = guard.read();
        Ok(page.read(offset, len)?.to_vec())
    }

    /// LSN of the last change applied to the page.
    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        Ok(self.atomic.cache().pin(page_id)?.page_lsn())
    }

    /// Takes a checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointMarker> {
        Ok(self.checkpoints.checkpoint()?)
    }

    /// Makes every record appended so far durable.
    pub fn flush_wal(&self) -> Result<()> {
        Ok(self.wal().flush_all()?)
    }

    /// Waits for running atomic operations to finish and blocks new ones
    /// until the guard is dropped.
    pub fn freeze(&self) -> FreezeGuard<'_> {
        self.atomic.freeze()
    }

    /// Shuts down cleanly: stops the checkpointer, persists every page and
    /// takes a final checkpoint.
    pub fn close(mut self) -> Result<()> {
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        self.checkpoints
            .checkpoint()
            .context("Final checkpoint failed")?;
        self.atomic.cache().flush_all()?;
        self.flush_wal()?;
        info!("Closed engine at {:?}", self.config.data_dir);
        Ok(())
    }
}
