//! Checkpoint management for recovery.
//!
//! A checkpoint persists every page dirtied before a cutoff LSN, logs the
//! units active at that point, and records the result in a small marker file.
//! Recovery starts from the marker; log segments no longer needed by it are
//! deleted.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atomic::id::OperationUnitId;
use crate::atomic::manager::AtomicOperationManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{CheckpointRecord, Lsn, WalRecord};

/// Name of the marker file inside the data directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.meta";

const CHECKSUM_SIZE: usize = 4;

/// Upper bound on how long the checkpointer sleeps between checks.
const CHECKPOINTER_TICK: Duration = Duration::from_millis(250);

/// Errors that can occur during checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint already in progress")]
    InProgress,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Durable pointer to the latest completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// LSN of the checkpoint record.
    pub checkpoint_lsn: Lsn,
    /// Redo starts here; pages dirtied earlier were persisted.
    pub cutoff_lsn: Lsn,
    /// First segment recovery needs.
    pub first_segment: u32,
    /// Segment holding the checkpoint record.
    pub last_segment: u32,
    /// Largest unit id handed out when the checkpoint was taken.
    pub last_unit_id: OperationUnitId,
}

impl CheckpointMarker {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Reads the marker in `dir`. A missing file means no checkpoint was
    /// ever completed.
    pub fn read(dir: &Path) -> StorageResult<Option<Self>> {
        let bytes = match fs::read(Self::path(dir)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < CHECKSUM_SIZE {
            return Err(StorageError::DataCorruption(
                "checkpoint marker is truncated".to_string(),
            ));
        }

        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        if crc32fast::hash(body) != LittleEndian::read_u32(checksum) {
            return Err(StorageError::DataCorruption(
                "checkpoint marker checksum mismatch".to_string(),
            ));
        }
        Ok(Some(bincode::deserialize(body)?))
    }

    /// Replaces the marker in `dir` atomically.
    pub fn write(&self, dir: &Path) -> StorageResult<()> {
        let mut bytes = bincode::serialize(self)?;
        let mut checksum = [0u8; CHECKSUM_SIZE];
        LittleEndian::write_u32(&mut checksum, crc32fast::hash(&bytes));
        bytes.extend_from_slice(&checksum);

        let path = Self::path(dir);
        let tmp = path.with_extension("meta.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        // Persist the rename itself.
        File::open(dir)?.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    last: Option<CheckpointMarker>,
    in_progress: bool,
}

/// Checkpoint manager handles creating checkpoints and trimming the log.
pub struct CheckpointManager {
    atomic: Arc<AtomicOperationManager>,
    dir: PathBuf,
    state: Mutex<CheckpointState>,
}

impl CheckpointManager {
    /// Creates a manager writing its marker into `dir`.
    pub fn new(atomic: Arc<AtomicOperationManager>, dir: impl Into<PathBuf>) -> Self {
        CheckpointManager {
            atomic,
            dir: dir.into(),
            state: Mutex::new(CheckpointState::default()),
        }
    }

    /// The last checkpoint completed by this manager.
    pub fn last_checkpoint(&self) -> Option<CheckpointMarker> {
        self.state.lock().last
    }

    /// Takes a checkpoint. Runs alongside normal traffic; a second caller
    /// while one is running gets [`CheckpointError::InProgress`].
    pub fn checkpoint(&self) -> Result<CheckpointMarker, CheckpointError> {
        {
            let mut state = self.state.lock();
            if state.in_progress {
                return Err(CheckpointError::InProgress);
            }
            state.in_progress = true;
        }

        let result = self.run();

        let mut state = self.state.lock();
        state.in_progress = false;
        if let Ok(marker) = &result {
            state.last = Some(*marker);
        }
        result
    }

    fn run(&self) -> Result<CheckpointMarker, CheckpointError> {
        let wal = self.atomic.wal();
        let snapshot = self.atomic.checkpoint_snapshot();
        let cutoff_lsn = snapshot.cutoff_lsn;

        let flushed = self.atomic.cache().flush_dirty_before(cutoff_lsn)?;

        // Recovery reads back from the oldest unit still open.
        let scan_start = snapshot
            .active_units
            .iter()
            .map(|(_, lsn)| *lsn)
            .fold(cutoff_lsn, Lsn::min);

        let record = WalRecord::checkpoint(CheckpointRecord {
            cutoff_lsn,
            active_units: snapshot.active_units,
        });
        let checkpoint_lsn = wal.append(&record)?;
        wal.flush(checkpoint_lsn)?;

        let marker = CheckpointMarker {
            checkpoint_lsn,
            cutoff_lsn,
            first_segment: scan_start.segment,
            last_segment: checkpoint_lsn.segment,
            last_unit_id: self.atomic.last_unit_id(),
        };
        marker.write(&self.dir)?;

        let truncate_before = match wal.min_cut_till_limit() {
            Some(limit) => limit.min(scan_start),
            None => scan_start,
        };
        let removed = match wal.truncate(truncate_before) {
            Ok(removed) => removed,
            Err(StorageError::SegmentInUse {
                requested,
                referenced,
            }) => {
                warn!(
                    "Skipped WAL truncation before {}: {} is still referenced",
                    requested, referenced
                );
                0
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Checkpoint at {} (cutoff {}, {} pages flushed, {} segments removed)",
            checkpoint_lsn, cutoff_lsn, flushed, removed
        );
        Ok(marker)
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread taking checkpoints periodically, and early when the log
/// outgrows its size limit. Stopped and joined on drop.
pub struct Checkpointer {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn start(manager: Arc<CheckpointManager>, interval: Duration) -> StorageResult<Self> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("vibewal-checkpointer".to_string())
            .spawn(move || Self::run(&manager, &thread_signal, interval))?;
        debug!("Checkpointer started with interval {:?}", interval);
        Ok(Checkpointer {
            signal,
            handle: Some(handle),
        })
    }

    fn run(manager: &CheckpointManager, signal: &StopSignal, interval: Duration) {
        let tick = interval.min(CHECKPOINTER_TICK);
        let mut last = Instant::now();
        loop {
            {
                let mut stopped = signal.stopped.lock();
                if !*stopped {
                    signal.wake.wait_for(&mut stopped, tick);
                }
                if *stopped {
                    break;
                }
            }

            if last.elapsed() < interval && !manager.atomic.wal().needs_checkpoint() {
                continue;
            }
            match manager.checkpoint() {
                Ok(_) => {}
                Err(CheckpointError::InProgress) => debug!("Checkpoint already running"),
                Err(e) => warn!("Background checkpoint failed: {}", e),
            }
            last = Instant::now();
        }
    }

    /// Stops the thread and waits for a running checkpoint to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Checkpointer thread panicked");
            }
            debug!("Checkpointer stopped");
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
