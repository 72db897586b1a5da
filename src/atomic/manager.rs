//! Atomic operation manager: the lifecycle of operation units.
//!
//! Every change made by a unit is logged and applied in one step, with the
//! inverse kept on the unit's undo stack. Commit makes the unit's records
//! durable; rollback walks the undo stack backwards, logging a compensation
//! record for each undone operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::id::{OperationUnitId, OperationUnitIdGenerator};
use super::operation::AtomicOperation;
use super::state::UnitState;
use crate::component::{ComponentError, ComponentId, ComponentRegistry};
use crate::recovery::apply::{Applier, ApplyError, MutationLocks};
use crate::storage::error::StorageError;
use crate::storage::wal::{
    CompensationRecord, ComponentOperation, Lsn, PageOperation, UndoAction, WalManager, WalRecord,
};
use crate::storage::PageCache;

/// Error types for atomic operations.
#[derive(Error, Debug)]
pub enum AtomicError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Component error: {0}")]
    Component(#[source] ComponentError),

    #[error("Atomic operation {unit} is {state}")]
    InvalidState {
        unit: OperationUnitId,
        state: UnitState,
    },

    #[error("Atomic operation {0} failed to log a change and must be rolled back")]
    Poisoned(OperationUnitId),
}

impl From<ComponentError> for AtomicError {
    fn from(e: ComponentError) -> Self {
        match e {
            ComponentError::Storage(e) => AtomicError::Storage(e),
            other => AtomicError::Component(other),
        }
    }
}

/// Result type for atomic operations.
pub type AtomicResult<T> = Result<T, AtomicError>;

/// Active units and log position a checkpoint is based on.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    /// Every record below this LSN has marked its pages dirty.
    pub cutoff_lsn: Lsn,
    /// Units active at the snapshot with their start LSNs.
    pub active_units: Vec<(OperationUnitId, Lsn)>,
}

#[derive(Default)]
struct FreezeState {
    freezes: usize,
    running: usize,
}

/// Blocks new units while a freeze is held.
#[derive(Default)]
struct Freezer {
    state: Mutex<FreezeState>,
    changed: Condvar,
}

/// Keeps new atomic operations from starting until dropped.
pub struct FreezeGuard<'a> {
    manager: &'a AtomicOperationManager,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        let freezer = &self.manager.freezer;
        freezer.state.lock().freezes -= 1;
        freezer.changed.notify_all();
        debug!("Atomic operations released");
    }
}

/// The atomic operation manager handles the lifecycle of all units.
pub struct AtomicOperationManager {
    wal: Arc<WalManager>,
    cache: PageCache,
    components: ComponentRegistry,
    locks: MutationLocks,
    id_generator: OperationUnitIdGenerator,
    /// Registered units and their start LSNs.
    active: Mutex<BTreeMap<OperationUnitId, Lsn>>,
    freezer: Freezer,
}

impl AtomicOperationManager {
    pub fn new(wal: Arc<WalManager>, cache: PageCache, components: ComponentRegistry) -> Self {
        Self {
            wal,
            cache,
            components,
            locks: MutationLocks::new(),
            id_generator: OperationUnitIdGenerator::new(),
            active: Mutex::new(BTreeMap::new()),
            freezer: Freezer::default(),
        }
    }

    fn applier(&self) -> Applier<'_> {
        Applier::new(&self.wal, &self.cache, &self.components, &self.locks)
    }

    /// Begins a new unit by logging its start record.
    pub fn begin(self: &Arc<Self>, metadata: Option<Vec<u8>>) -> AtomicResult<AtomicOperation> {
        self.enter();
        let unit_id = self.id_generator.next();
        let record = WalRecord::unit_start(unit_id, metadata.clone());

        let start_lsn = {
            let _gate = self.locks.gate().read();
            match self.wal.append(&record) {
                Ok(lsn) => {
                    self.active.lock().insert(unit_id, lsn);
                    self.wal.add_cut_till_limit(lsn);
                    lsn
                }
                Err(e) => {
                    self.leave();
                    return Err(e.into());
                }
            }
        };

        let mut op = AtomicOperation::new(Arc::clone(self), unit_id, start_lsn, metadata);
        Self::transition(&mut op, UnitState::Active)?;
        debug!("Started atomic operation {} at {}", unit_id, start_lsn);
        Ok(op)
    }

    /// Logs a page operation of `op` and applies its redo image.
    pub fn record_page_operation(
        &self,
        op: &mut AtomicOperation,
        page_op: PageOperation,
    ) -> AtomicResult<Lsn> {
        Self::check_writable(op)?;
        let result = self
            .applier()
            .log_page_operation(op.unit_id, op.last_lsn, &page_op);
        let undo = UndoAction::Page {
            page_id: page_op.page_id,
            delta: page_op.undo,
        };
        Self::track(op, result, undo)
    }

    /// Logs a component operation of `op` and runs the component's redo. The
    /// unit owns the component from then on until it commits or rolls back.
    pub fn record_component_operation(
        &self,
        op: &mut AtomicOperation,
        component_id: ComponentId,
        redo: Vec<u8>,
        undo: Vec<u8>,
    ) -> AtomicResult<Lsn> {
        Self::check_writable(op)?;
        let component_op = ComponentOperation {
            component_id,
            redo,
            undo,
        };
        let result = self
            .applier()
            .log_component_operation(op.unit_id, op.last_lsn, &component_op);
        let undo = UndoAction::Component {
            component_id,
            payload: component_op.undo,
        };
        Self::track(op, result, undo)
    }

    fn check_writable(op: &AtomicOperation) -> AtomicResult<()> {
        if op.poisoned {
            return Err(AtomicError::Poisoned(op.unit_id));
        }
        if op.state != UnitState::Active {
            return Err(AtomicError::InvalidState {
                unit: op.unit_id,
                state: op.state,
            });
        }
        Ok(())
    }

    fn track(
        op: &mut AtomicOperation,
        result: Result<Lsn, ApplyError>,
        undo: UndoAction,
    ) -> AtomicResult<Lsn> {
        match result {
            Ok(lsn) => {
                op.last_lsn = lsn;
                op.undo_stack.push((lsn, undo));
                trace!("Atomic operation {} logged change at {}", op.unit_id, lsn);
                Ok(lsn)
            }
            Err(ApplyError::Log(e)) => {
                if is_write_failure(&e) {
                    op.poisoned = true;
                }
                Err(e.into())
            }
            Err(ApplyError::Apply { lsn, source }) => {
                // Logged but not applied: the undo still belongs on the stack.
                op.last_lsn = lsn;
                op.undo_stack.push((lsn, undo));
                op.poisoned = true;
                Err(source.into())
            }
        }
    }

    fn transition(op: &mut AtomicOperation, next: UnitState) -> AtomicResult<()> {
        if !op.state.can_transition_to(next) {
            return Err(AtomicError::InvalidState {
                unit: op.unit_id,
                state: op.state,
            });
        }
        op.state = next;
        Ok(())
    }

    /// Commits the unit. Returns once its commit record is durable.
    ///
    /// If making the record durable fails, the unit stays `Committing` and
    /// its outcome is decided by recovery.
    pub fn commit(&self, op: &mut AtomicOperation) -> AtomicResult<()> {
        Self::check_writable(op)?;
        Self::transition(op, UnitState::Committing)?;

        let lsn = match self
            .wal
            .append(&WalRecord::unit_commit(op.unit_id, op.last_lsn))
        {
            Ok(lsn) => lsn,
            Err(e) => {
                Self::transition(op, UnitState::Active)?;
                if matches!(e, StorageError::Io(_)) {
                    op.poisoned = true;
                }
                return Err(e.into());
            }
        };
        op.last_lsn = lsn;
        self.wal.flush(lsn)?;

        Self::transition(op, UnitState::Committed)?;
        op.undo_stack.clear();
        self.finish(op);
        debug!("Committed atomic operation {} at {}", op.unit_id, lsn);
        Ok(())
    }

    /// Rolls the unit back, compensating its operations newest first.
    ///
    /// A rollback that failed part way can be retried; it continues with the
    /// operations not yet compensated.
    pub fn rollback(&self, op: &mut AtomicOperation) -> AtomicResult<()> {
        if op.state != UnitState::RollingBack {
            Self::transition(op, UnitState::RollingBack)?;
        }

        let applier = self.applier();
        while let Some((lsn, action)) = op.undo_stack.pop() {
            let undo_next_lsn = op
                .undo_stack
                .last()
                .map(|(lsn, _)| *lsn)
                .unwrap_or(op.start_lsn);
            let co = CompensationRecord {
                compensated_lsn: lsn,
                undo_next_lsn,
                action,
            };
            match applier.compensate(op.unit_id, op.last_lsn, &co) {
                Ok(co_lsn) => op.last_lsn = co_lsn,
                Err(ApplyError::Log(e)) => {
                    op.undo_stack.push((lsn, co.action));
                    if is_write_failure(&e) {
                        op.poisoned = true;
                    }
                    return Err(e.into());
                }
                Err(ApplyError::Apply { lsn: co_lsn, source }) => {
                    op.last_lsn = co_lsn;
                    op.poisoned = true;
                    return Err(source.into());
                }
            }
        }

        let lsn = self
            .wal
            .append(&WalRecord::unit_rollback(op.unit_id, op.last_lsn))?;
        op.last_lsn = lsn;
        Self::transition(op, UnitState::RolledBack)?;
        self.finish(op);
        debug!("Rolled back atomic operation {} at {}", op.unit_id, lsn);
        Ok(())
    }

    /// Runs `f` inside a new unit: commits when it returns `Ok`, rolls back
    /// when it returns `Err`.
    pub fn execute_inside<T, E, F>(
        self: &Arc<Self>,
        metadata: Option<Vec<u8>>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<T, E>,
        E: From<AtomicError>,
    {
        let mut op = self.begin(metadata)?;
        match f(&mut op) {
            Ok(value) => {
                self.commit(&mut op)?;
                Ok(value)
            }
            Err(e) => {
                if op.state.is_active() {
                    self.rollback(&mut op)?;
                }
                Err(e)
            }
        }
    }

    /// Waits until no unit is running and keeps new ones from starting until
    /// the guard is dropped. Must not be called while holding an active unit.
    pub fn freeze(&self) -> FreezeGuard<'_> {
        let mut state = self.freezer.state.lock();
        state.freezes += 1;
        while state.running > 0 {
            self.freezer.changed.wait(&mut state);
        }
        debug!("Atomic operations frozen");
        FreezeGuard { manager: self }
    }

    fn enter(&self) {
        let mut state = self.freezer.state.lock();
        while state.freezes > 0 {
            self.freezer.changed.wait(&mut state);
        }
        state.running += 1;
    }

    fn leave(&self) {
        self.freezer.state.lock().running -= 1;
        self.freezer.changed.notify_all();
    }

    /// Unregisters a unit that reached its terminal record.
    fn finish(&self, op: &mut AtomicOperation) {
        if !op.registered {
            return;
        }
        self.active.lock().remove(&op.unit_id);
        self.wal.remove_cut_till_limit(op.start_lsn);
        self.locks.release_components(op.unit_id);
        op.registered = false;
        self.leave();
    }

    /// Releases a unit that cannot finish in this process. It stays listed as
    /// active, so checkpoints keep its log and recovery resolves it. The
    /// components it changed stay owned by it until then.
    pub(super) fn abandon(&self, op: &mut AtomicOperation) {
        if !op.registered {
            return;
        }
        op.registered = false;
        self.leave();
    }

    /// Cutoff and active units for a checkpoint. Every record below the
    /// cutoff has already marked its pages dirty.
    pub fn checkpoint_snapshot(&self) -> CheckpointSnapshot {
        let _gate = self.locks.gate().write();
        let cutoff_lsn = self.wal.end_lsn();
        let active_units = self
            .active
            .lock()
            .iter()
            .map(|(unit, lsn)| (*unit, *lsn))
            .collect();
        CheckpointSnapshot {
            cutoff_lsn,
            active_units,
        }
    }

    /// Units currently registered as active, with their start LSNs.
    pub fn active_units(&self) -> Vec<(OperationUnitId, Lsn)> {
        self.active
            .lock()
            .iter()
            .map(|(unit, lsn)| (*unit, *lsn))
            .collect()
    }

    /// Makes sure new units get ids above `id`.
    pub fn advance_ids_past(&self, id: OperationUnitId) {
        self.id_generator.advance_past(id);
    }

    /// Largest unit id handed out so far.
    pub fn last_unit_id(&self) -> OperationUnitId {
        self.id_generator.current()
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }
}

fn is_write_failure(e: &ComponentError) -> bool {
    matches!(e, ComponentError::Storage(StorageError::Io(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentContext, DurableComponent};
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::wal::{PageDelta, WalConfig, WalRecordPayload};
    use crate::storage::{PageId, PageManager, StorageResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const MIRROR: ComponentId = ComponentId(7);

    /// Writes the same bytes into two pages. Payload: `[offset: u16 LE][bytes]`.
    struct Mirror;

    impl Mirror {
        fn pages() -> [PageId; 2] {
            [PageId::new(9, 0), PageId::new(9, 1)]
        }

        fn payload(offset: u16, bytes: &[u8]) -> Vec<u8> {
            let mut payload = offset.to_le_bytes().to_vec();
            payload.extend_from_slice(bytes);
            payload
        }

        fn apply(ctx: &mut ComponentContext<'_>, payload: &[u8]) -> Result<(), ComponentError> {
            if payload.len() < 2 {
                return Err(ComponentError::InvalidPayload {
                    component: MIRROR,
                    reason: "missing offset".to_string(),
                });
            }
            let offset = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            for page_id in Self::pages() {
                ctx.write(page_id, offset, &payload[2..])?;
            }
            Ok(())
        }
    }

    impl DurableComponent for Mirror {
        fn redo(&self, ctx: &mut ComponentContext<'_>, payload: &[u8]) -> Result<(), ComponentError> {
            Self::apply(ctx, payload)
        }

        fn undo(&self, ctx: &mut ComponentContext<'_>, payload: &[u8]) -> Result<(), ComponentError> {
            Self::apply(ctx, payload)
        }
    }

    fn create_manager() -> (Arc<AtomicOperationManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(
            WalManager::open(WalConfig {
                wal_dir: dir.path().join("wal"),
                fsync: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let page_manager = PageManager::open(&dir.path().join("pages"), false).unwrap();
        let cache = PageCache::new(page_manager, Box::new(LruReplacer::new(32)), 32, Arc::clone(&wal));
        let mut components = ComponentRegistry::new();
        components.register(MIRROR, Arc::new(Mirror));
        (
            Arc::new(AtomicOperationManager::new(wal, cache, components)),
            dir,
        )
    }

    fn write_op(page: u32, offset: usize, new: &[u8], old: &[u8]) -> PageOperation {
        PageOperation::new(
            PageId::new(1, page),
            PageDelta::new(offset, new.to_vec()).unwrap(),
            PageDelta::new(offset, old.to_vec()).unwrap(),
        )
        .unwrap()
    }

    fn bytes(manager: &AtomicOperationManager, page_id: PageId, offset: usize, len: usize) -> Vec<u8> {
        let guard = manager.cache().pin(page_id).unwrap();
        let page = guard.read();
        page.read(offset, len).unwrap().to_vec()
    }

    fn log_of(manager: &AtomicOperationManager) -> Vec<(Lsn, WalRecord)> {
        manager
            .wal()
            .iterate(Lsn::NULL)
            .unwrap()
            .collect::<StorageResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_begin_registers_unit() {
        let (manager, _dir) = create_manager();
        let op = manager.begin(Some(b"meta".to_vec())).unwrap();

        assert_eq!(op.state(), UnitState::Active);
        assert_eq!(op.metadata(), Some(&b"meta"[..]));
        assert_eq!(manager.active_units(), vec![(op.unit_id(), op.start_lsn())]);
        assert_eq!(manager.wal().min_cut_till_limit(), Some(op.start_lsn()));

        let record = manager.wal().read(op.start_lsn()).unwrap();
        assert_eq!(
            record.payload,
            WalRecordPayload::UnitStart {
                metadata: Some(b"meta".to_vec())
            }
        );
    }

    #[test]
    fn test_commit_makes_unit_durable() {
        let (manager, _dir) = create_manager();
        let mut op = manager.begin(None).unwrap();
        manager
            .record_page_operation(&mut op, write_op(0, 0, b"abc", &[0, 0, 0]))
            .unwrap();
        manager.commit(&mut op).unwrap();

        assert_eq!(op.state(), UnitState::Committed);
        assert_eq!(op.pending_undo(), 0);
        assert!(manager.wal().flushed_lsn() > op.last_lsn());
        assert!(manager.active_units().is_empty());
        assert_eq!(manager.wal().min_cut_till_limit(), None);
        assert_eq!(bytes(&manager, PageId::new(1, 0), 0, 3), b"abc");

        assert!(matches!(
            manager.commit(&mut op),
            Err(AtomicError::InvalidState {
                state: UnitState::Committed,
                ..
            })
        ));
    }

    #[test]
    fn test_records_are_chained_per_unit() {
        let (manager, _dir) = create_manager();
        let mut a = manager.begin(None).unwrap();
        let mut b = manager.begin(None).unwrap();
        manager.record_page_operation(&mut a, write_op(0, 0, &[1], &[0])).unwrap();
        manager.record_page_operation(&mut b, write_op(1, 0, &[2], &[0])).unwrap();
        manager.record_page_operation(&mut a, write_op(0, 1, &[3], &[0])).unwrap();
        manager.commit(&mut a).unwrap();
        manager.commit(&mut b).unwrap();

        let mut last: BTreeMap<OperationUnitId, Lsn> = BTreeMap::new();
        for (lsn, record) in log_of(&manager) {
            let expected = last.get(&record.unit_id()).copied().unwrap_or(Lsn::NULL);
            assert_eq!(record.prev_lsn(), expected);
            last.insert(record.unit_id(), lsn);
        }
    }

    #[test]
    fn test_rollback_restores_pages_and_logs_compensations() {
        let (manager, _dir) = create_manager();
        let page_id = PageId::new(1, 0);
        let mut op = manager.begin(None).unwrap();
        let first = manager
            .record_page_operation(&mut op, write_op(0, 0, b"xy", &[0, 0]))
            .unwrap();
        let second = manager
            .record_page_operation(&mut op, write_op(0, 1, b"zz", b"y\0"))
            .unwrap();
        assert_eq!(bytes(&manager, page_id, 0, 3), b"xzz");

        manager.rollback(&mut op).unwrap();
        assert_eq!(op.state(), UnitState::RolledBack);
        assert_eq!(bytes(&manager, page_id, 0, 3), &[0, 0, 0]);
        assert!(manager.active_units().is_empty());

        let compensations: Vec<CompensationRecord> = log_of(&manager)
            .into_iter()
            .filter_map(|(_, record)| match record.payload {
                WalRecordPayload::Compensation(co) => Some(co),
                _ => None,
            })
            .collect();
        assert_eq!(compensations.len(), 2);
        assert_eq!(compensations[0].compensated_lsn, second);
        assert_eq!(compensations[0].undo_next_lsn, first);
        assert_eq!(compensations[1].compensated_lsn, first);
        assert_eq!(compensations[1].undo_next_lsn, op.start_lsn());

        let (_, terminal) = log_of(&manager).pop().unwrap();
        assert_eq!(terminal.payload, WalRecordPayload::UnitRollback);
    }

    #[test]
    fn test_component_operation_and_rollback() {
        let (manager, _dir) = create_manager();
        let [left, right] = Mirror::pages();
        let mut op = manager.begin(None).unwrap();
        manager
            .record_component_operation(
                &mut op,
                MIRROR,
                Mirror::payload(4, b"hi"),
                Mirror::payload(4, &[0, 0]),
            )
            .unwrap();
        assert_eq!(bytes(&manager, left, 4, 2), b"hi");
        assert_eq!(bytes(&manager, right, 4, 2), b"hi");

        manager.rollback(&mut op).unwrap();
        assert_eq!(bytes(&manager, left, 4, 2), &[0, 0]);
        assert_eq!(bytes(&manager, right, 4, 2), &[0, 0]);
    }

    #[test]
    fn test_failed_component_redo_poisons_unit() {
        let (manager, _dir) = create_manager();
        let mut op = manager.begin(None).unwrap();
        let result = manager.record_component_operation(&mut op, MIRROR, vec![1], vec![]);
        assert!(matches!(
            result,
            Err(AtomicError::Component(ComponentError::InvalidPayload { .. }))
        ));
        assert!(op.is_poisoned());
        assert_eq!(op.pending_undo(), 1);

        assert!(matches!(
            manager.commit(&mut op),
            Err(AtomicError::Poisoned(_))
        ));
        assert!(matches!(
            manager.record_page_operation(&mut op, write_op(0, 0, &[1], &[0])),
            Err(AtomicError::Poisoned(_))
        ));
    }

    #[test]
    fn test_unknown_component_is_rejected_without_poisoning() {
        let (manager, _dir) = create_manager();
        let mut op = manager.begin(None).unwrap();
        let result = manager.record_component_operation(&mut op, ComponentId(99), vec![], vec![]);
        assert!(matches!(
            result,
            Err(AtomicError::Component(ComponentError::UnknownComponent(_)))
        ));
        assert!(!op.is_poisoned());
        manager.commit(&mut op).unwrap();
    }

    #[test]
    fn test_execute_inside_commits_or_rolls_back() {
        let (manager, _dir) = create_manager();
        let page_id = PageId::new(1, 2);

        let value: Result<u32, AtomicError> = manager.execute_inside(None, |op| {
            manager.record_page_operation(op, write_op(2, 0, &[7], &[0]))?;
            Ok(5)
        });
        assert_eq!(value.unwrap(), 5);
        assert_eq!(bytes(&manager, page_id, 0, 1), &[7]);

        let failed: Result<(), anyhow::Error> = manager.execute_inside(None, |op| {
            manager.record_page_operation(op, write_op(2, 0, &[8], &[7]))?;
            anyhow::bail!("caller changed its mind")
        });
        assert!(failed.is_err());
        assert_eq!(bytes(&manager, page_id, 0, 1), &[7]);
        assert!(manager.active_units().is_empty());
    }

    #[test]
    fn test_component_is_owned_until_unit_ends() {
        let (manager, _dir) = create_manager();
        let [left, right] = Mirror::pages();
        let mut first = manager.begin(None).unwrap();
        manager
            .record_component_operation(
                &mut first,
                MIRROR,
                Mirror::payload(0, b"a"),
                Mirror::payload(0, &[0]),
            )
            .unwrap();
        assert_eq!(manager.locks.component_owner(MIRROR), Some(first.unit_id()));

        let recorded = Arc::new(AtomicBool::new(false));
        let second = {
            let manager = Arc::clone(&manager);
            let recorded = Arc::clone(&recorded);
            thread::spawn(move || {
                let mut op = manager.begin(None).unwrap();
                manager
                    .record_component_operation(
                        &mut op,
                        MIRROR,
                        Mirror::payload(0, b"b"),
                        Mirror::payload(0, b"a"),
                    )
                    .unwrap();
                recorded.store(true, Ordering::SeqCst);
                manager.commit(&mut op).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!recorded.load(Ordering::SeqCst));
        assert_eq!(bytes(&manager, left, 0, 1), b"a");

        // Rolling back restores the state the first unit saw, before the
        // second unit's change is applied on top of it.
        manager.rollback(&mut first).unwrap();
        second.join().unwrap();
        assert!(recorded.load(Ordering::SeqCst));
        assert_eq!(bytes(&manager, left, 0, 1), b"b");
        assert_eq!(bytes(&manager, right, 0, 1), b"b");
        assert_eq!(manager.locks.component_owner(MIRROR), None);
    }

    #[test]
    fn test_finished_unit_rejects_transitions() {
        let (manager, _dir) = create_manager();
        let mut op = manager.begin(None).unwrap();
        manager
            .record_page_operation(&mut op, write_op(4, 0, &[1], &[0]))
            .unwrap();
        manager.rollback(&mut op).unwrap();
        assert_eq!(op.state(), UnitState::RolledBack);

        assert!(matches!(
            manager.rollback(&mut op),
            Err(AtomicError::InvalidState {
                state: UnitState::RolledBack,
                ..
            })
        ));
        assert!(matches!(
            manager.commit(&mut op),
            Err(AtomicError::InvalidState {
                state: UnitState::RolledBack,
                ..
            })
        ));

        let mut committed = manager.begin(None).unwrap();
        manager.commit(&mut committed).unwrap();
        assert!(matches!(
            manager.rollback(&mut committed),
            Err(AtomicError::InvalidState {
                state: UnitState::Committed,
                ..
            })
        ));
    }

    #[test]
    fn test_dropped_operation_is_rolled_back() {
        let (manager, _dir) = create_manager();
        {
            let mut op = manager.begin(None).unwrap();
            manager
                .record_page_operation(&mut op, write_op(3, 0, &[1], &[0]))
                .unwrap();
        }
        assert_eq!(bytes(&manager, PageId::new(1, 3), 0, 1), &[0]);
        assert!(manager.active_units().is_empty());
    }

    #[test]
    fn test_freeze_blocks_new_units() {
        let (manager, _dir) = create_manager();
        let mut running = manager.begin(None).unwrap();

        let frozen = Arc::new(AtomicBool::new(false));
        let freezer = {
            let manager = Arc::clone(&manager);
            let frozen = Arc::clone(&frozen);
            thread::spawn(move || {
                let _guard = manager.freeze();
                frozen.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!frozen.load(Ordering::SeqCst));
        manager.commit(&mut running).unwrap();
        freezer.join().unwrap();
        assert!(frozen.load(Ordering::SeqCst));

        let mut op = manager.begin(None).unwrap();
        manager.commit(&mut op).unwrap();
    }

    #[test]
    fn test_checkpoint_snapshot_lists_active_units() {
        let (manager, _dir) = create_manager();
        let mut done = manager.begin(None).unwrap();
        manager.commit(&mut done).unwrap();
        let open = manager.begin(None).unwrap();

        let snapshot = manager.checkpoint_snapshot();
        assert_eq!(snapshot.active_units, vec![(open.unit_id(), open.start_lsn())]);
        assert_eq!(snapshot.cutoff_lsn, manager.wal().end_lsn());
        assert!(snapshot.cutoff_lsn > open.start_lsn());
    }

    #[test]
    fn test_ids_resume_after_advance() {
        let (manager, _dir) = create_manager();
        manager.advance_ids_past(OperationUnitId::new(100));
        let mut op = manager.begin(None).unwrap();
        assert_eq!(op.unit_id(), OperationUnitId::new(101));
        assert_eq!(manager.last_unit_id(), OperationUnitId::new(101));
        manager.commit(&mut op).unwrap();
    }
}
