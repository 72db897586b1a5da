//! ARIES (Algorithm for Recovery and Isolation Exploiting Semantics) implementation.
//!
//! Implements the three phases of ARIES:
//! 1. Analysis: Reconstruct the unit table at crash time
//! 2. Redo: Repeat history from the checkpoint cutoff
//! 3. Undo: Compensate the operations of units that never finished

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use super::apply::{Applier, ApplyError, MutationLocks};
use super::checkpoint::CheckpointMarker;
use crate::atomic::id::OperationUnitId;
use crate::atomic::state::UnitState;
use crate::component::{ComponentError, ComponentRegistry};
use crate::storage::error::StorageError;
use crate::storage::wal::{CompensationRecord, Lsn, WalManager, WalRecord, WalRecordPayload};
use crate::storage::PageCache;

/// Errors that can occur during recovery.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Log corrupted at {lsn}: {reason}")]
    DataCorruption { lsn: Lsn, reason: String },

    #[error("Redo of the record at {lsn} failed: {source}")]
    RedoFailed {
        lsn: Lsn,
        #[source]
        source: ComponentError,
    },

    #[error("Undo of the record at {lsn} failed: {source}")]
    UndoFailed {
        lsn: Lsn,
        #[source]
        source: ComponentError,
    },
}

fn corruption(lsn: Lsn, reason: impl Into<String>) -> RecoveryError {
    RecoveryError::DataCorruption {
        lsn,
        reason: reason.into(),
    }
}

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryStats {
    /// Number of records analyzed.
    pub records_analyzed: usize,
    /// Number of records whose changes were reapplied.
    pub records_redone: usize,
    /// Number of redoable records every target page already reflected.
    pub records_skipped: usize,
    /// Number of operations undone.
    pub records_undone: usize,
    /// Number of compensation records written.
    pub compensations_written: usize,
    /// Units that reached their commit record.
    pub winners: usize,
    /// Units rolled back by recovery.
    pub losers: usize,
    /// Where the analysis scan started.
    pub start_lsn: Lsn,
    /// End of the log after recovery.
    pub end_lsn: Lsn,
    /// Largest unit id seen in the log or the checkpoint marker.
    pub max_unit_id: OperationUnitId,
}

/// Unit table entry rebuilt by analysis.
#[derive(Debug, Clone)]
struct UnitEntry {
    state: UnitState,
    start_lsn: Lsn,
    last_lsn: Lsn,
    /// Operations not yet compensated.
    pending: BTreeSet<Lsn>,
}

impl UnitEntry {
    fn new(start_lsn: Lsn) -> Self {
        UnitEntry {
            state: UnitState::Active,
            start_lsn,
            last_lsn: start_lsn,
            pending: BTreeSet::new(),
        }
    }

    fn is_loser(&self) -> bool {
        matches!(self.state, UnitState::Active | UnitState::RollingBack)
    }

    /// Folds the next record of this unit into the entry.
    fn track(&mut self, unit: OperationUnitId, lsn: Lsn, record: &WalRecord) -> Result<(), RecoveryError> {
        if self.state.is_finished() {
            return Err(corruption(
                lsn,
                format!("record of {} after its terminal record", unit),
            ));
        }
        if record.prev_lsn() != self.last_lsn {
            return Err(corruption(
                lsn,
                format!(
                    "record of {} links to {} but the unit's previous record is at {}",
                    unit,
                    record.prev_lsn(),
                    self.last_lsn
                ),
            ));
        }

        match &record.payload {
            WalRecordPayload::UnitStart { .. } => {
                return Err(corruption(lsn, format!("duplicate start record of {}", unit)));
            }
            WalRecordPayload::PageOperation(_) | WalRecordPayload::ComponentOperation(_) => {
                if self.state != UnitState::Active {
                    return Err(corruption(
                        lsn,
                        format!("operation of {} logged after its rollback began", unit),
                    ));
                }
                self.pending.insert(lsn);
            }
            WalRecordPayload::Compensation(co) => {
                if !self.pending.remove(&co.compensated_lsn) {
                    return Err(corruption(
                        lsn,
                        format!(
                            "compensation of {} for {}, which is not an open operation of the unit",
                            unit, co.compensated_lsn
                        ),
                    ));
                }
                self.state = UnitState::RollingBack;
            }
            WalRecordPayload::UnitCommit => {
                if self.state != UnitState::Active {
                    return Err(corruption(
                        lsn,
                        format!("commit of {} after its rollback began", unit),
                    ));
                }
                self.state = UnitState::Committed;
            }
            WalRecordPayload::UnitRollback => {
                if !self.pending.is_empty() {
                    return Err(corruption(
                        lsn,
                        format!(
                            "rollback record of {} with {} operations not compensated",
                            unit,
                            self.pending.len()
                        ),
                    ));
                }
                self.state = UnitState::RolledBack;
            }
            WalRecordPayload::Checkpoint(_) => {
                return Err(corruption(lsn, format!("checkpoint record logged by {}", unit)));
            }
        }
        self.last_lsn = lsn;
        Ok(())
    }
}

/// Result of the analysis phase.
#[derive(Debug)]
struct Analysis {
    units: BTreeMap<OperationUnitId, UnitEntry>,
    redo_start: Lsn,
}

/// ARIES recovery manager.
pub struct AriesRecovery {
    wal: Arc<WalManager>,
    cache: PageCache,
    components: ComponentRegistry,
    locks: MutationLocks,
}

impl AriesRecovery {
    /// Create a new ARIES recovery manager.
    pub fn new(wal: Arc<WalManager>, cache: PageCache, components: ComponentRegistry) -> Self {
        AriesRecovery {
            wal,
            cache,
            components,
            locks: MutationLocks::new(),
        }
    }

    fn applier(&self) -> Applier<'_> {
        Applier::new(&self.wal, &self.cache, &self.components, &self.locks)
    }

    /// Perform full ARIES recovery, starting from `checkpoint` when one was
    /// taken. Must run before any new unit begins.
    pub fn recover(&self, checkpoint: Option<&CheckpointMarker>) -> Result<RecoveryStats, RecoveryError> {
        let mut stats = RecoveryStats::default();

        // Phase 1: Analysis
        let mut analysis = self.analysis_phase(checkpoint, &mut stats)?;
        info!(
            "Recovery analysis: {} records from {}, {} winners, {} losers",
            stats.records_analyzed, stats.start_lsn, stats.winners, stats.losers
        );

        // Phase 2: Redo
        self.redo_phase(&analysis, &mut stats)?;
        info!(
            "Recovery redo: {} records reapplied, {} already on disk",
            stats.records_redone, stats.records_skipped
        );

        // Phase 3: Undo
        self.undo_phase(&mut analysis, &mut stats)?;
        info!(
            "Recovery undo: {} operations compensated",
            stats.records_undone
        );

        self.wal.flush_all()?;
        stats.end_lsn = self.wal.end_lsn();
        Ok(stats)
    }

    /// Phase 1: Analysis - Rebuild the unit table and check the log's
    /// structure.
    fn analysis_phase(
        &self,
        checkpoint: Option<&CheckpointMarker>,
        stats: &mut RecoveryStats,
    ) -> Result<Analysis, RecoveryError> {
        let (cutoff, checkpoint_units) = match checkpoint {
            Some(marker) => {
                let record = self.wal.read(marker.checkpoint_lsn)?;
                match record.payload {
                    WalRecordPayload::Checkpoint(cp) => (cp.cutoff_lsn, cp.active_units),
                    _ => {
                        return Err(corruption(
                            marker.checkpoint_lsn,
                            "checkpoint marker does not point at a checkpoint record",
                        ))
                    }
                }
            }
            None => (Lsn::NULL, Vec::new()),
        };

        let start = checkpoint_units
            .iter()
            .map(|(_, lsn)| *lsn)
            .fold(cutoff, Lsn::min);
        stats.start_lsn = start;
        stats.max_unit_id = checkpoint
            .map(|marker| marker.last_unit_id)
            .unwrap_or(OperationUnitId::SYSTEM);
        for (unit, _) in &checkpoint_units {
            stats.max_unit_id = stats.max_unit_id.max(*unit);
        }

        let mut units: BTreeMap<OperationUnitId, UnitEntry> = BTreeMap::new();
        for item in self.wal.iterate(start)? {
            let (lsn, record) = item?;
            stats.records_analyzed += 1;

            let unit = record.unit_id();
            if unit.is_system() {
                if !matches!(record.payload, WalRecordPayload::Checkpoint(_)) {
                    return Err(corruption(lsn, "unit record logged by the system unit"));
                }
                continue;
            }
            stats.max_unit_id = stats.max_unit_id.max(unit);

            match units.entry(unit) {
                Entry::Occupied(entry) => entry.into_mut().track(unit, lsn, &record)?,
                Entry::Vacant(entry) => match record.payload {
                    WalRecordPayload::UnitStart { .. } => {
                        if !record.prev_lsn().is_null() {
                            return Err(corruption(
                                lsn,
                                format!("start record of {} links to {}", unit, record.prev_lsn()),
                            ));
                        }
                        entry.insert(UnitEntry::new(lsn));
                    }
                    // Finished before the checkpoint.
                    _ if lsn < cutoff => {}
                    _ => {
                        return Err(corruption(
                            lsn,
                            format!("record of {} without a start record", unit),
                        ))
                    }
                },
            }
        }

        for (unit, start_lsn) in &checkpoint_units {
            if !units.contains_key(unit) {
                return Err(corruption(
                    *start_lsn,
                    format!("{} was active at the checkpoint but its start record is missing", unit),
                ));
            }
        }

        stats.winners = units
            .values()
            .filter(|entry| entry.state == UnitState::Committed)
            .count();
        stats.losers = units.values().filter(|entry| entry.is_loser()).count();
        Ok(Analysis {
            units,
            redo_start: cutoff,
        })
    }

    /// Phase 2: Redo - Reapply every change from the cutoff on that its pages
    /// do not yet reflect, compensations included.
    fn redo_phase(&self, analysis: &Analysis, stats: &mut RecoveryStats) -> Result<(), RecoveryError> {
        let applier = self.applier();
        for item in self.wal.iterate(analysis.redo_start)? {
            let (lsn, record) = item?;
            match record.payload {
                WalRecordPayload::PageOperation(_)
                | WalRecordPayload::ComponentOperation(_)
                | WalRecordPayload::Compensation(_) => {}
                _ => continue,
            }

            let applied = applier
                .redo(lsn, &record.payload)
                .map_err(|source| RecoveryError::RedoFailed { lsn, source })?;
            if applied {
                stats.records_redone += 1;
            } else {
                stats.records_skipped += 1;
            }
        }
        Ok(())
    }

    /// Phase 3: Undo - Compensate the open operations of all losers, newest
    /// first across units.
    fn undo_phase(&self, analysis: &mut Analysis, stats: &mut RecoveryStats) -> Result<(), RecoveryError> {
        let applier = self.applier();

        let mut work: BTreeMap<Lsn, OperationUnitId> = BTreeMap::new();
        let mut finished = Vec::new();
        for (unit, entry) in analysis.units.iter().filter(|(_, entry)| entry.is_loser()) {
            if entry.pending.is_empty() {
                finished.push(*unit);
            }
            work.extend(entry.pending.iter().map(|lsn| (*lsn, *unit)));
        }
        for unit in finished {
            self.finish_loser(analysis, unit)?;
        }

        while let Some((lsn, unit)) = work.pop_last() {
            let entry = analysis
                .units
                .get_mut(&unit)
                .ok_or_else(|| corruption(lsn, format!("{} is missing from the unit table", unit)))?;

            let record = self.wal.read(lsn)?;
            let action = record
                .payload
                .undo_action()
                .ok_or_else(|| corruption(lsn, "record to undo is not an operation"))?;

            entry.pending.remove(&lsn);
            let undo_next_lsn = entry.pending.last().copied().unwrap_or(entry.start_lsn);
            let co = CompensationRecord {
                compensated_lsn: lsn,
                undo_next_lsn,
                action,
            };
            entry.last_lsn = match applier.compensate(unit, entry.last_lsn, &co) {
                Ok(co_lsn) => co_lsn,
                Err(ApplyError::Log(source)) | Err(ApplyError::Apply { source, .. }) => {
                    return Err(RecoveryError::UndoFailed { lsn, source })
                }
            };
            entry.state = UnitState::RollingBack;
            stats.records_undone += 1;
            stats.compensations_written += 1;

            if entry.pending.is_empty() {
                self.finish_loser(analysis, unit)?;
            }
        }
        Ok(())
    }

    fn finish_loser(&self, analysis: &mut Analysis, unit: OperationUnitId) -> Result<(), RecoveryError> {
        let entry = analysis
            .units
            .get_mut(&unit)
            .ok_or_else(|| corruption(Lsn::NULL, format!("{} is missing from the unit table", unit)))?;
        let lsn = self
            .wal
            .append(&WalRecord::unit_rollback(unit, entry.last_lsn))?;
        entry.last_lsn = lsn;
        entry.state = UnitState::RolledBack;
        self.locks.release_components(unit);
        debug!("Recovery rolled back {} at {}", unit, lsn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::wal::{PageDelta, PageOperation, UndoAction, WalConfig};
    use crate::storage::{PageId, PageManager, StorageResult};
    use std::path::Path;
    use tempfile::TempDir;

    /// A fresh WAL and page cache over `dir`, as after a restart.
    fn open(dir: &Path) -> (Arc<WalManager>, PageCache) {
        let wal = Arc::new(
            WalManager::open(WalConfig {
                wal_dir: dir.join("wal"),
                fsync: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let page_manager = PageManager::open(&dir.join("pages"), false).unwrap();
        let cache = PageCache::new(page_manager, Box::new(LruReplacer::new(16)), 16, Arc::clone(&wal));
        (wal, cache)
    }

    fn recover(dir: &Path) -> Result<(RecoveryStats, Arc<WalManager>, PageCache), RecoveryError> {
        let (wal, cache) = open(dir);
        let recovery = AriesRecovery::new(Arc::clone(&wal), cache.clone(), ComponentRegistry::new());
        let stats = recovery.recover(None)?;
        Ok((stats, wal, cache))
    }

    fn write_op(page: u32, offset: usize, value: u8, old: u8) -> PageOperation {
        PageOperation::new(
            PageId::new(0, page),
            PageDelta::new(offset, vec![value]).unwrap(),
            PageDelta::new(offset, vec![old]).unwrap(),
        )
        .unwrap()
    }

    /// Writes records straight to the log; pages are never touched.
    struct LogWriter {
        wal: Arc<WalManager>,
        last: BTreeMap<OperationUnitId, Lsn>,
    }

    impl LogWriter {
        fn new(wal: Arc<WalManager>) -> Self {
            LogWriter {
                wal,
                last: BTreeMap::new(),
            }
        }

        fn start(&mut self, unit: u64) -> Lsn {
            let unit = OperationUnitId::new(unit);
            let lsn = self.wal.append(&WalRecord::unit_start(unit, None)).unwrap();
            self.last.insert(unit, lsn);
            lsn
        }

        fn append(&mut self, unit: u64, payload: WalRecordPayload) -> Lsn {
            let unit = OperationUnitId::new(unit);
            let prev = self.last.get(&unit).copied().unwrap_or(Lsn::NULL);
            let lsn = self.wal.append(&WalRecord::new(unit, prev, payload)).unwrap();
            self.last.insert(unit, lsn);
            lsn
        }

        fn flush(&self) {
            self.wal.flush_all().unwrap();
        }
    }

    fn byte(cache: &PageCache, page: u32, offset: usize) -> u8 {
        cache.pin(PageId::new(0, page)).unwrap().read().read(offset, 1).unwrap()[0]
    }

    fn records(wal: &WalManager) -> Vec<(Lsn, WalRecord)> {
        wal.iterate(Lsn::NULL)
            .unwrap()
            .collect::<StorageResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_empty_recovery() {
        let dir = TempDir::new().unwrap();
        let (stats, _, _) = recover(dir.path()).unwrap();
        assert_eq!(stats.records_analyzed, 0);
        assert_eq!(stats.records_redone, 0);
        assert_eq!(stats.records_undone, 0);
        assert_eq!(stats.max_unit_id, OperationUnitId::SYSTEM);
    }

    #[test]
    fn test_committed_unit_is_redone() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(1);
            log.append(1, WalRecordPayload::PageOperation(write_op(0, 0, 7, 0)));
            log.append(1, WalRecordPayload::UnitCommit);
            log.flush();
        }

        let (stats, _, cache) = recover(dir.path()).unwrap();
        assert_eq!(stats.winners, 1);
        assert_eq!(stats.losers, 0);
        assert_eq!(stats.records_redone, 1);
        assert_eq!(stats.max_unit_id, OperationUnitId::new(1));
        assert_eq!(byte(&cache, 0, 0), 7);
    }

    #[test]
    fn test_unfinished_unit_is_compensated() {
        let dir = TempDir::new().unwrap();
        let (first, second);
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(4);
            first = log.append(4, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            second = log.append(4, WalRecordPayload::PageOperation(write_op(0, 1, 2, 0)));
            log.flush();
        }

        let (stats, wal, cache) = recover(dir.path()).unwrap();
        assert_eq!(stats.losers, 1);
        assert_eq!(stats.records_undone, 2);
        assert_eq!(byte(&cache, 0, 0), 0);
        assert_eq!(byte(&cache, 0, 1), 0);

        let tail: Vec<WalRecordPayload> = records(&wal)
            .into_iter()
            .skip(3)
            .map(|(_, record)| record.payload)
            .collect();
        assert_eq!(tail.len(), 3);
        match (&tail[0], &tail[1]) {
            (WalRecordPayload::Compensation(a), WalRecordPayload::Compensation(b)) => {
                assert_eq!(a.compensated_lsn, second);
                assert_eq!(a.undo_next_lsn, first);
                assert_eq!(b.compensated_lsn, first);
            }
            other => panic!("unexpected records {:?}", other),
        }
        assert_eq!(tail[2], WalRecordPayload::UnitRollback);

        // A second run finds nothing left to do.
        drop((wal, cache));
        let (again, _, cache) = recover(dir.path()).unwrap();
        assert_eq!(again.losers, 0);
        assert_eq!(again.records_undone, 0);
        assert_eq!(byte(&cache, 0, 0), 0);
    }

    #[test]
    fn test_partial_rollback_resumes() {
        let dir = TempDir::new().unwrap();
        let (first, second);
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            let start = log.start(2);
            first = log.append(2, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            second = log.append(2, WalRecordPayload::PageOperation(write_op(0, 0, 2, 1)));
            log.append(
                2,
                WalRecordPayload::Compensation(CompensationRecord {
                    compensated_lsn: second,
                    undo_next_lsn: first,
                    action: UndoAction::Page {
                        page_id: PageId::new(0, 0),
                        delta: PageDelta::new(0, vec![1]).unwrap(),
                    },
                }),
            );
            assert!(start < first);
            log.flush();
        }

        let (stats, _, cache) = recover(dir.path()).unwrap();
        // Redo repeats both operations and the compensation.
        assert_eq!(stats.records_redone, 3);
        assert_eq!(stats.records_undone, 1);
        assert_eq!(byte(&cache, 0, 0), 0);
    }

    #[test]
    fn test_losers_are_undone_in_descending_order() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(1);
            log.start(2);
            log.append(1, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            log.append(2, WalRecordPayload::PageOperation(write_op(0, 0, 2, 1)));
            log.flush();
        }

        let (_, wal, cache) = recover(dir.path()).unwrap();
        assert_eq!(byte(&cache, 0, 0), 0);

        let compensated: Vec<Lsn> = records(&wal)
            .into_iter()
            .filter_map(|(_, record)| match record.payload {
                WalRecordPayload::Compensation(co) => Some(co.compensated_lsn),
                _ => None,
            })
            .collect();
        assert_eq!(compensated.len(), 2);
        assert!(compensated[0] > compensated[1]);
    }

    #[test]
    fn test_broken_chain_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let start = wal
                .append(&WalRecord::unit_start(OperationUnitId::new(1), None))
                .unwrap();
            wal.append(&WalRecord::page_operation(
                OperationUnitId::new(1),
                Lsn::new(start.segment, start.position + 1),
                write_op(0, 0, 1, 0),
            ))
            .unwrap();
            wal.flush_all().unwrap();
        }

        assert!(matches!(
            recover(dir.path()),
            Err(RecoveryError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_missing_start_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.append(9, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            log.flush();
        }

        assert!(matches!(
            recover(dir.path()),
            Err(RecoveryError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_record_after_commit_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(1);
            log.append(1, WalRecordPayload::UnitCommit);
            log.append(1, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            log.flush();
        }

        assert!(matches!(
            recover(dir.path()),
            Err(RecoveryError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_foreign_compensation_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(1);
            log.start(2);
            let op = log.append(1, WalRecordPayload::PageOperation(write_op(0, 0, 1, 0)));
            log.append(
                2,
                WalRecordPayload::Compensation(CompensationRecord {
                    compensated_lsn: op,
                    undo_next_lsn: Lsn::NULL,
                    action: UndoAction::Page {
                        page_id: PageId::new(0, 0),
                        delta: PageDelta::new(0, vec![0]).unwrap(),
                    },
                }),
            );
            log.flush();
        }

        assert!(matches!(
            recover(dir.path()),
            Err(RecoveryError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_unknown_component_fails_redo() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open(dir.path());
            let mut log = LogWriter::new(wal);
            log.start(1);
            log.append(
                1,
                WalRecordPayload::ComponentOperation(crate::storage::wal::ComponentOperation {
                    component_id: crate::component::ComponentId(5),
                    redo: vec![],
                    undo: vec![],
                }),
            );
            log.append(1, WalRecordPayload::UnitCommit);
            log.flush();
        }

        assert!(matches!(
            recover(dir.path()),
            Err(RecoveryError::RedoFailed {
                source: ComponentError::UnknownComponent(_),
                ..
            })
        ));
    }
}
