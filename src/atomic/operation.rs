//! The per-unit context of an atomic operation.

use std::sync::Arc;

use log::warn;

use super::id::OperationUnitId;
use super::manager::AtomicOperationManager;
use super::state::UnitState;
use crate::storage::wal::{Lsn, UndoAction};

/// A handle to an active atomic operation unit.
///
/// Operations are recorded and the unit is finished through the
/// [`AtomicOperationManager`]. A handle dropped while still active is rolled
/// back on a best-effort basis.
pub struct AtomicOperation {
    pub(super) manager: Arc<AtomicOperationManager>,
    pub(super) unit_id: OperationUnitId,
    pub(super) state: UnitState,
    pub(super) start_lsn: Lsn,
    pub(super) last_lsn: Lsn,
    /// Inverse of every operation recorded so far, oldest first.
    pub(super) undo_stack: Vec<(Lsn, UndoAction)>,
    /// Set when a write failed; the unit can then only be rolled back.
    pub(super) poisoned: bool,
    /// Whether the unit still counts as active in the manager.
    pub(super) registered: bool,
    metadata: Option<Vec<u8>>,
}

impl AtomicOperation {
    pub(super) fn new(
        manager: Arc<AtomicOperationManager>,
        unit_id: OperationUnitId,
        start_lsn: Lsn,
        metadata: Option<Vec<u8>>,
    ) -> Self {
        Self {
            manager,
            unit_id,
            state: UnitState::NotStarted,
            start_lsn,
            last_lsn: start_lsn,
            undo_stack: Vec::new(),
            poisoned: false,
            registered: true,
            metadata,
        }
    }

    pub fn unit_id(&self) -> OperationUnitId {
        self.unit_id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// LSN of the unit's start record.
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// LSN of the unit's most recent record.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of operations that would be undone by a rollback.
    pub fn pending_undo(&self) -> usize {
        self.undo_stack.len()
    }

    /// Metadata attached when the unit started.
    pub fn metadata(&self) -> Option<&[u8]> {
        self.metadata.as_deref()
    }
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("unit_id", &self.unit_id)
            .field("state", &self.state)
            .field("start_lsn", &self.start_lsn)
            .field("last_lsn", &self.last_lsn)
            .field("pending_undo", &self.undo_stack.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let manager = Arc::clone(&self.manager);
        match self.state {
            UnitState::Active | UnitState::RollingBack => {
                warn!(
                    "Atomic operation {} dropped while {}, rolling it back",
                    self.unit_id, self.state
                );
                if let Err(e) = manager.rollback(self) {
                    warn!(
                        "Rollback of dropped atomic operation {} failed, recovery will finish it: {}",
                        self.unit_id, e
                    );
                    manager.abandon(self);
                }
            }
            _ => {
                warn!(
                    "Atomic operation {} dropped while {}, recovery will decide its outcome",
                    self.unit_id, self.state
                );
                manager.abandon(self);
            }
        }
    }
}
