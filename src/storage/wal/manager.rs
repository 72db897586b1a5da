//! WAL manager implementation.
//!
//! The WAL manager assigns LSNs, batches frames in an in-memory buffer,
//! rotates segment files and makes records durable on request. At open it
//! repairs a torn tail left by a crash in the middle of a write.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::BytesMut;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::record::{Lsn, WalRecord, MAX_RECORD_SIZE};
use super::segment::{
    find_intact_frame, list_segments, segment_path, ReadOutcome, SegmentReader,
};
use crate::storage::error::{StorageError, StorageResult};

/// Largest accepted segment size. Positions must fit in the LSN's `u32`
/// even when a maximal record lands at the end of a full segment.
pub const MAX_SEGMENT_SIZE: u64 = u32::MAX as u64 - MAX_RECORD_SIZE as u64;

/// WAL manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory where WAL segments are stored.
    pub wal_dir: PathBuf,
    /// A new segment starts when a record would push the current one past
    /// this size.
    pub max_segment_size: u64,
    /// Retained log size above which a checkpoint is requested.
    pub wal_size_limit: u64,
    /// Size of the in-memory buffer in front of the active segment.
    pub buffer_size: usize,
    /// Whether flushes fsync the segment file.
    pub fsync: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: PathBuf::from("wal"),
            max_segment_size: 64 * 1024 * 1024,
            wal_size_limit: 512 * 1024 * 1024,
            buffer_size: 1024 * 1024,
            fsync: true,
        }
    }
}

/// WAL buffer for batching writes.
struct WalBuffer {
    data: BytesMut,
    capacity: usize,
}

impl WalBuffer {
    fn new(capacity: usize) -> Self {
        WalBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, frame: &[u8]) {
        self.data.extend_from_slice(frame);
    }

    fn would_overflow(&self, additional: usize) -> bool {
        !self.data.is_empty() && self.data.len() + additional > self.capacity
    }

    fn contents(&self) -> &[u8] {
        &self.data
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// The segment currently receiving appends.
struct ActiveSegment {
    id: u32,
    file: File,
    /// Bytes handed to the OS.
    written: u64,
}

struct WalState {
    /// Retained segments and their sizes, buffered bytes included.
    segments: BTreeMap<u32, u64>,
    active: ActiveSegment,
    buffer: WalBuffer,
    /// LSN the next appended record receives.
    end: Lsn,
    /// Every record below this LSN is durable.
    flushed_end: Lsn,
    /// Set after a failed write; the file tail is then unknown.
    broken: bool,
}

/// WAL manager for handling write-ahead logging.
pub struct WalManager {
    config: WalConfig,
    state: Mutex<WalState>,
    /// Reference-counted LSNs the log may not be truncated past.
    cut_till_limits: Mutex<BTreeMap<Lsn, usize>>,
}

impl WalManager {
    /// Opens the log in `config.wal_dir`, creating the first segment if the
    /// directory is empty and cutting off a torn tail otherwise.
    pub fn open(config: WalConfig) -> StorageResult<Self> {
        fs::create_dir_all(&config.wal_dir)?;

        let ids = list_segments(&config.wal_dir)?;
        let mut segments = BTreeMap::new();
        let active = match ids.last() {
            None => {
                let file = Self::create_segment_file(&config, 1)?;
                segments.insert(1, 0);
                ActiveSegment {
                    id: 1,
                    file,
                    written: 0,
                }
            }
            Some(&last) => {
                for &id in &ids[..ids.len() - 1] {
                    segments.insert(id, fs::metadata(segment_path(&config.wal_dir, id))?.len());
                }
                let valid_len = Self::repair_tail(&config, last)?;
                segments.insert(last, valid_len);

                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(segment_path(&config.wal_dir, last))?;
                file.seek(SeekFrom::Start(valid_len))?;
                ActiveSegment {
                    id: last,
                    file,
                    written: valid_len,
                }
            }
        };

        let end = Lsn::new(active.id, active.written as u32);
        debug!(
            "Opened WAL in {:?}: {} segment(s), end {}",
            config.wal_dir,
            segments.len(),
            end
        );

        let buffer = WalBuffer::new(config.buffer_size);
        Ok(WalManager {
            config,
            state: Mutex::new(WalState {
                segments,
                active,
                buffer,
                end,
                flushed_end: end,
                broken: false,
            }),
            cut_till_limits: Mutex::new(BTreeMap::new()),
        })
    }

    /// Scans the last segment and truncates it after its last valid record.
    ///
    /// Damage is only a torn tail when no intact frame follows it; anything
    /// else is corruption and fails the open.
    fn repair_tail(config: &WalConfig, segment: u32) -> StorageResult<u64> {
        let mut reader = SegmentReader::open(&config.wal_dir, segment, 0, None)?;
        let (cut, reason) = loop {
            match reader.read_next()? {
                ReadOutcome::Record(..) => continue,
                ReadOutcome::Eof => return Ok(u64::from(reader.position())),
                ReadOutcome::Malformed { position, reason } => {
                    return Err(StorageError::DataCorruption(format!(
                        "malformed WAL record at {}: {}",
                        Lsn::new(segment, position),
                        reason
                    )))
                }
                ReadOutcome::TornWrite { position, reason } => break (position, Some(reason)),
                ReadOutcome::ChecksumMismatch { position } => break (position, None),
            }
        };

        let damaged = Lsn::new(segment, cut);
        if let Some(intact) = find_intact_frame(&config.wal_dir, segment, cut)? {
            return Err(match reason {
                None => StorageError::ChecksumMismatch { lsn: damaged },
                Some(reason) => StorageError::DataCorruption(format!(
                    "damaged WAL record at {} ({}) followed by an intact record at {}",
                    damaged,
                    reason,
                    Lsn::new(segment, intact)
                )),
            });
        }
        warn!(
            "Torn WAL tail in segment {} at offset {}: {}",
            segment,
            cut,
            reason.as_deref().unwrap_or("checksum mismatch")
        );

        let path = segment_path(&config.wal_dir, segment);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(u64::from(cut))?;
        file.sync_all()?;
        Ok(u64::from(cut))
    }

    fn create_segment_file(config: &WalConfig, id: u32) -> StorageResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(segment_path(&config.wal_dir, id))?;
        if config.fsync {
            // Persist the new directory entry.
            File::open(&config.wal_dir)?.sync_all()?;
        }
        Ok(file)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Appends a record and returns its LSN. The record is durable only after
    /// a [`flush`](Self::flush) covering it.
    pub fn append(&self, record: &WalRecord) -> StorageResult<Lsn> {
        let frame = record.encode()?;
        let mut state = self.state.lock();
        Self::check_usable(&state)?;

        let active_size = state.active.written + state.buffer.len() as u64;
        if active_size > 0 && active_size + frame.len() as u64 > self.config.max_segment_size {
            self.guard(&mut *state, Self::rotate)?;
        } else if state.buffer.would_overflow(frame.len()) {
            self.guard(&mut *state, Self::write_buffer)?;
        }

        let lsn = state.end;
        state.buffer.push(&frame);
        state.end.position += frame.len() as u32;
        let active_id = state.active.id;
        *state.segments.entry(active_id).or_insert(0) += frame.len() as u64;

        trace!(
            "Appended {:?} of unit {} at {}",
            record.header.record_type,
            record.unit_id(),
            lsn
        );
        Ok(lsn)
    }

    /// Makes every record with an LSN up to and including `upto` durable.
    ///
    /// Callers are coalesced: one flush writes everything buffered, so a
    /// caller whose record was covered by an earlier flush returns at once.
    pub fn flush(&self, upto: Lsn) -> StorageResult<()> {
        let mut state = self.state.lock();
        if upto < state.flushed_end {
            return Ok(());
        }
        Self::check_usable(&state)?;
        self.guard(&mut *state, Self::write_buffer)?;
        if self.config.fsync {
            self.guard(&mut *state, |_, state| {
                state.active.file.sync_data()?;
                Ok(())
            })?;
        }
        state.flushed_end = state.end;
        Ok(())
    }

    /// Flushes everything appended so far.
    pub fn flush_all(&self) -> StorageResult<()> {
        let end = self.end_lsn();
        if end.position == 0 {
            return Ok(());
        }
        self.flush(Lsn::new(end.segment, end.position - 1))
    }

    /// Runs a write step; a failure leaves the file tail unknown, so the log
    /// refuses further writes.
    fn guard<F>(&self, state: &mut WalState, step: F) -> StorageResult<()>
    where
        F: FnOnce(&Self, &mut WalState) -> StorageResult<()>,
    {
        let result = step(self, state);
        if result.is_err() {
            state.broken = true;
        }
        result
    }

    fn check_usable(state: &WalState) -> StorageResult<()> {
        if state.broken {
            return Err(StorageError::Io(io::Error::other(
                "write-ahead log is unusable after a failed write",
            )));
        }
        Ok(())
    }

    fn write_buffer(&self, state: &mut WalState) -> StorageResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        state.active.file.write_all(state.buffer.contents())?;
        state.active.written += state.buffer.len() as u64;
        state.buffer.clear();
        Ok(())
    }

    /// Seals the active segment and starts the next one.
    fn rotate(&self, state: &mut WalState) -> StorageResult<()> {
        self.write_buffer(state)?;
        if self.config.fsync {
            state.active.file.sync_data()?;
        }

        let id = state.active.id + 1;
        let file = Self::create_segment_file(&self.config, id)?;
        debug!(
            "Rotated WAL from segment {} ({} bytes) to {}",
            state.active.id, state.active.written, id
        );
        state.active = ActiveSegment {
            id,
            file,
            written: 0,
        };
        state.segments.insert(id, 0);
        state.end = Lsn::new(id, 0);
        state.flushed_end = state.end;
        Ok(())
    }

    /// LSN the next record will receive.
    pub fn end_lsn(&self) -> Lsn {
        self.state.lock().end
    }

    /// Every record below this LSN is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_end
    }

    /// LSN of the first retained byte of the log.
    pub fn begin_lsn(&self) -> Lsn {
        let state = self.state.lock();
        let first = state
            .segments
            .keys()
            .next()
            .copied()
            .unwrap_or(state.active.id);
        Lsn::new(first, 0)
    }

    /// Retained segment ids, ascending.
    pub fn segments(&self) -> Vec<u32> {
        self.state.lock().segments.keys().copied().collect()
    }

    /// Total size of the retained log in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().segments.values().sum()
    }

    /// True once the retained log outgrows `wal_size_limit` and a checkpoint
    /// could release whole segments.
    pub fn needs_checkpoint(&self) -> bool {
        let state = self.state.lock();
        state.segments.len() > 1 && state.segments.values().sum::<u64>() > self.config.wal_size_limit
    }

    /// Hands buffered frames to the OS so readers can see them, and returns
    /// the end of the log at that point.
    fn expose(&self) -> StorageResult<(Lsn, Vec<u32>)> {
        let mut state = self.state.lock();
        Self::check_usable(&state)?;
        self.guard(&mut *state, Self::write_buffer)?;
        Ok((state.end, state.segments.keys().copied().collect()))
    }

    /// Iterates records from `from` up to the end of the log as it is now.
    ///
    /// `from` must be the LSN of a record, the end of the log or
    /// [`Lsn::NULL`], which starts at the first retained record.
    pub fn iterate(&self, from: Lsn) -> StorageResult<WalIterator> {
        let (end, segments) = self.expose()?;
        let first = segments.first().copied().unwrap_or(end.segment);
        let start = if from.is_null() {
            Lsn::new(first, 0)
        } else {
            from
        };
        if start.segment < first || start > end || !segments.contains(&start.segment) {
            return Err(StorageError::InvalidLsn(from));
        }

        let pending = segments
            .into_iter()
            .filter(|&id| id > start.segment && id <= end.segment)
            .collect();
        Ok(WalIterator {
            dir: self.config.wal_dir.clone(),
            end,
            pending,
            next_start: Some(start),
            reader: None,
            done: false,
        })
    }

    /// Reads the record at `lsn`.
    pub fn read(&self, lsn: Lsn) -> StorageResult<WalRecord> {
        let (end, segments) = self.expose()?;
        if lsn >= end || !segments.contains(&lsn.segment) {
            return Err(StorageError::InvalidLsn(lsn));
        }
        let limit = (lsn.segment == end.segment).then_some(end.position);
        let mut reader = SegmentReader::open(&self.config.wal_dir, lsn.segment, lsn.position, limit)?;
        match reader.read_next()? {
            ReadOutcome::Record(_, record) => Ok(record),
            ReadOutcome::ChecksumMismatch { .. } => Err(StorageError::ChecksumMismatch { lsn }),
            ReadOutcome::Eof => Err(StorageError::InvalidLsn(lsn)),
            ReadOutcome::TornWrite { reason, .. } | ReadOutcome::Malformed { reason, .. } => {
                Err(StorageError::DataCorruption(format!(
                    "no readable record at {}: {}",
                    lsn, reason
                )))
            }
        }
    }

    /// Deletes every segment lying entirely before `before`. The active
    /// segment is always kept. Returns the number of deleted segments.
    pub fn truncate(&self, before: Lsn) -> StorageResult<usize> {
        let limits = self.cut_till_limits.lock();
        if let Some((&referenced, _)) = limits.iter().next() {
            if referenced.segment < before.segment {
                return Err(StorageError::SegmentInUse {
                    requested: before,
                    referenced,
                });
            }
        }

        let mut state = self.state.lock();
        let active = state.active.id;
        let victims: Vec<u32> = state
            .segments
            .keys()
            .copied()
            .filter(|&id| id < before.segment && id != active)
            .collect();
        for &id in &victims {
            fs::remove_file(segment_path(&self.config.wal_dir, id))?;
            state.segments.remove(&id);
        }
        if !victims.is_empty() {
            debug!("Truncated WAL segments {:?} before {}", victims, before);
        }
        Ok(victims.len())
    }

    /// Pins `lsn` so that truncation cannot remove its segment.
    pub fn add_cut_till_limit(&self, lsn: Lsn) {
        *self.cut_till_limits.lock().entry(lsn).or_insert(0) += 1;
    }

    /// Releases one pin taken with [`add_cut_till_limit`](Self::add_cut_till_limit).
    pub fn remove_cut_till_limit(&self, lsn: Lsn) {
        let mut limits = self.cut_till_limits.lock();
        if let Some(count) = limits.get_mut(&lsn) {
            *count -= 1;
            if *count == 0 {
                limits.remove(&lsn);
            }
        }
    }

    /// Smallest pinned LSN, if any.
    pub fn min_cut_till_limit(&self) -> Option<Lsn> {
        self.cut_till_limits.lock().keys().next().copied()
    }
}

/// Forward iterator over a fixed range of the log.
///
/// Yields `(lsn, record)` pairs. A damaged record inside the range ends the
/// iteration with an error.
pub struct WalIterator {
    dir: PathBuf,
    end: Lsn,
    pending: Vec<u32>,
    next_start: Option<Lsn>,
    reader: Option<SegmentReader>,
    done: bool,
}

impl WalIterator {
    /// End of the range, exclusive.
    pub fn end(&self) -> Lsn {
        self.end
    }

    fn next_record(&mut self) -> StorageResult<Option<(Lsn, WalRecord)>> {
        loop {
            if self.reader.is_none() {
                let start = match self.next_start.take() {
                    Some(start) => start,
                    None if self.pending.is_empty() => return Ok(None),
                    None => Lsn::new(self.pending.remove(0), 0),
                };
                let limit = (start.segment == self.end.segment).then_some(self.end.position);
                self.reader = Some(SegmentReader::open(
                    &self.dir,
                    start.segment,
                    start.position,
                    limit,
                )?);
            }

            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => continue,
            };
            let segment = reader.segment();
            match reader.read_next()? {
                ReadOutcome::Record(lsn, record) => return Ok(Some((lsn, record))),
                ReadOutcome::Eof => self.reader = None,
                ReadOutcome::ChecksumMismatch { position } => {
                    return Err(StorageError::ChecksumMismatch {
                        lsn: Lsn::new(segment, position),
                    })
                }
                ReadOutcome::TornWrite { position, reason }
                | ReadOutcome::Malformed { position, reason } => {
                    return Err(StorageError::DataCorruption(format!(
                        "damaged record at {}: {}",
                        Lsn::new(segment, position),
                        reason
                    )))
                }
            }
        }
    }
}

impl Iterator for WalIterator {
    type Item = StorageResult<(Lsn, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
