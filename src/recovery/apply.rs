//! Applying logged operations to pages.
//!
//! The same code path serves forward processing, rollback and recovery, so a
//! change is always applied the same way: record appended, page image or
//! component payload applied, page stamped with the record's LSN and marked
//! dirty, all while the mutation gate is held for reading.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;

use crate::atomic::id::OperationUnitId;
use crate::component::{ComponentContext, ComponentError, ComponentId, ComponentRegistry};
use crate::storage::error::StorageError;
use crate::storage::page::check_bounds;
use crate::storage::wal::{
    CompensationRecord, ComponentOperation, Lsn, PageDelta, PageOperation, UndoAction,
    WalManager, WalRecord, WalRecordPayload,
};
use crate::storage::{PageCache, PageId};

/// Failure while logging and applying one operation.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// Nothing was logged.
    #[error("Operation was not logged: {0}")]
    Log(ComponentError),

    /// The record at `lsn` was logged but applying it failed.
    #[error("Applying the record at {lsn} failed: {source}")]
    Apply {
        lsn: Lsn,
        #[source]
        source: ComponentError,
    },
}

impl From<StorageError> for ApplyError {
    fn from(e: StorageError) -> Self {
        ApplyError::Log(ComponentError::Storage(e))
    }
}

/// Locks shared by every thread that logs changes.
///
/// The gate is held for reading across "append record, apply it, mark the
/// page dirty"; a checkpoint takes it for writing to pick its cutoff. Always
/// taken before any page lock.
///
/// A component is owned by the first unit that logs against it and stays
/// owned until that unit commits or rolls back, so no other unit can change
/// pages the component manages in between.
#[derive(Default)]
pub struct MutationLocks {
    gate: RwLock<()>,
    ownership: Mutex<Ownership>,
    released: Condvar,
}

#[derive(Default)]
struct Ownership {
    owners: HashMap<ComponentId, OperationUnitId>,
    /// Component each blocked unit waits for.
    waiting: HashMap<OperationUnitId, ComponentId>,
}

impl Ownership {
    fn blocker(&self, component: ComponentId, unit: OperationUnitId) -> Option<OperationUnitId> {
        self.owners
            .get(&component)
            .copied()
            .filter(|owner| *owner != unit)
    }

    /// Whether `unit` waiting for `component` closes a cycle of waiters.
    fn would_deadlock(&self, component: ComponentId, unit: OperationUnitId) -> bool {
        let mut current = self.blocker(component, unit);
        let mut hops = 0;
        while let Some(owner) = current {
            if owner == unit {
                return true;
            }
            hops += 1;
            if hops > self.waiting.len() {
                break;
            }
            current = self
                .waiting
                .get(&owner)
                .and_then(|next| self.owners.get(next))
                .copied();
        }
        false
    }
}

impl MutationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self) -> &RwLock<()> {
        &self.gate
    }

    /// Takes `component` for `unit`, waiting while another unit owns it.
    /// Reentrant for the owning unit. Fails instead of waiting when the
    /// owner is itself waiting, directly or not, for a component `unit` owns.
    pub fn lock_component(
        &self,
        component: ComponentId,
        unit: OperationUnitId,
    ) -> Result<(), ComponentError> {
        let mut ownership = self.ownership.lock();
        while ownership.blocker(component, unit).is_some() {
            if ownership.would_deadlock(component, unit) {
                ownership.waiting.remove(&unit);
                return Err(ComponentError::Deadlock { component, unit });
            }
            ownership.waiting.insert(unit, component);
            self.released.wait(&mut ownership);
        }
        ownership.waiting.remove(&unit);
        ownership.owners.insert(component, unit);
        Ok(())
    }

    /// Releases every component owned by `unit`.
    pub fn release_components(&self, unit: OperationUnitId) {
        let mut ownership = self.ownership.lock();
        let before = ownership.owners.len();
        ownership.owners.retain(|_, owner| *owner != unit);
        if ownership.owners.len() != before {
            self.released.notify_all();
        }
    }

    /// Unit currently owning `component`.
    pub fn component_owner(&self, component: ComponentId) -> Option<OperationUnitId> {
        self.ownership.lock().owners.get(&component).copied()
    }
}

pub struct Applier<'a> {
    wal: &'a WalManager,
    cache: &'a PageCache,
    components: &'a ComponentRegistry,
    locks: &'a MutationLocks,
}

impl<'a> Applier<'a> {
    pub fn new(
        wal: &'a WalManager,
        cache: &'a PageCache,
        components: &'a ComponentRegistry,
        locks: &'a MutationLocks,
    ) -> Self {
        Self {
            wal,
            cache,
            components,
            locks,
        }
    }

    /// Logs a page operation and applies its redo image.
    pub fn log_page_operation(
        &self,
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        op: &PageOperation,
    ) -> Result<Lsn, ApplyError> {
        check_bounds(op.undo.offset(), op.undo.len())?;
        let record = WalRecord::page_operation(unit_id, prev_lsn, op.clone());
        self.log_page_write(&record, op.page_id, &op.redo)
    }

    /// Logs a component operation and runs the component's redo.
    pub fn log_component_operation(
        &self,
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        op: &ComponentOperation,
    ) -> Result<Lsn, ApplyError> {
        let record = WalRecord::component_operation(unit_id, prev_lsn, op.clone());
        self.log_component_call(&record, op.component_id, &op.redo, false)
    }

    /// Logs a compensation record and applies the undo it describes.
    pub fn compensate(
        &self,
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        co: &CompensationRecord,
    ) -> Result<Lsn, ApplyError> {
        let record = WalRecord::compensation(unit_id, prev_lsn, co.clone());
        match &co.action {
            UndoAction::Page { page_id, delta } => self.log_page_write(&record, *page_id, delta),
            UndoAction::Component {
                component_id,
                payload,
            } => self.log_component_call(&record, *component_id, payload, true),
        }
    }

    fn log_page_write(
        &self,
        record: &WalRecord,
        page_id: PageId,
        delta: &PageDelta,
    ) -> Result<Lsn, ApplyError> {
        check_bounds(delta.offset(), delta.len())?;
        let guard = self.cache.pin(page_id)?;
        let _gate = self.locks.gate.read();
        let mut page = guard.write();

        let lsn = self.wal.append(record)?;
        page.write(delta.offset(), &delta.data)
            .map_err(|e| ApplyError::Apply {
                lsn,
                source: e.into(),
            })?;
        page.stamp_lsn(lsn);
        self.cache.mark_dirty(page_id, lsn);
        Ok(lsn)
    }

    fn log_component_call(
        &self,
        record: &WalRecord,
        component_id: ComponentId,
        payload: &[u8],
        undo: bool,
    ) -> Result<Lsn, ApplyError> {
        let component = self.components.get(component_id).map_err(ApplyError::Log)?;
        // Held until the unit ends; released by the atomic operation manager.
        self.locks
            .lock_component(component_id, record.unit_id())
            .map_err(ApplyError::Log)?;
        let _gate = self.locks.gate.read();

        let lsn = self.wal.append(record)?;
        let mut ctx = ComponentContext::new(self.cache, lsn, false);
        let result = if undo {
            component.undo(&mut ctx, payload)
        } else {
            component.redo(&mut ctx, payload)
        };
        result.map_err(|source| ApplyError::Apply { lsn, source })?;
        Ok(lsn)
    }

    /// Re-applies a logged record during recovery. Pages already carrying
    /// `lsn` or a later change are left alone. Returns whether anything was
    /// written.
    pub fn redo(&self, lsn: Lsn, payload: &WalRecordPayload) -> Result<bool, ComponentError> {
        match payload {
            WalRecordPayload::PageOperation(op) => self.redo_page(lsn, op.page_id, &op.redo),
            WalRecordPayload::ComponentOperation(op) => {
                self.redo_component(lsn, op.component_id, &op.redo, false)
            }
            WalRecordPayload::Compensation(co) => match &co.action {
                UndoAction::Page { page_id, delta } => self.redo_page(lsn, *page_id, delta),
                UndoAction::Component {
                    component_id,
                    payload,
                } => self.redo_component(lsn, *component_id, payload, true),
            },
            WalRecordPayload::UnitStart { .. }
            | WalRecordPayload::UnitCommit
            | WalRecordPayload::UnitRollback
            | WalRecordPayload::Checkpoint(_) => Ok(false),
        }
    }

    fn redo_page(&self, lsn: Lsn, page_id: PageId, delta: &PageDelta) -> Result<bool, ComponentError> {
        let guard = self.cache.pin(page_id)?;
        let _gate = self.locks.gate.read();
        let mut page = guard.write();
        if page.lsn() >= lsn {
            return Ok(false);
        }
        page.write(delta.offset(), &delta.data)?;
        page.stamp_lsn(lsn);
        self.cache.mark_dirty(page_id, lsn);
        Ok(true)
    }

    fn redo_component(
        &self,
        lsn: Lsn,
        component_id: ComponentId,
        payload: &[u8],
        undo: bool,
    ) -> Result<bool, ComponentError> {
        let component = self.components.get(component_id)?;
        let _gate = self.locks.gate.read();

        let mut ctx = ComponentContext::new(self.cache, lsn, true);
        if undo {
            component.undo(&mut ctx, payload)?;
        } else {
            component.redo(&mut ctx, payload)?;
        }
        Ok(ctx.applied() > 0)
    }
}
