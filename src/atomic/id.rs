//! Operation unit id generation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of an atomic operation unit.
///
/// Id 0 is reserved for records that belong to no unit, such as checkpoints.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperationUnitId(pub u64);

impl OperationUnitId {
    /// The reserved system unit.
    pub const SYSTEM: OperationUnitId = OperationUnitId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}

impl std::fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unit{}", self.0)
    }
}

/// A thread-safe, monotonic unit id generator.
pub struct OperationUnitIdGenerator {
    next_id: AtomicU64,
}

impl OperationUnitIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> OperationUnitId {
        OperationUnitId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The most recently generated id, or 0 if none was generated.
    pub fn current(&self) -> OperationUnitId {
        OperationUnitId::new(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Makes sure every future id is larger than `id`. Used after recovery so
    /// that new units never reuse an id found in the log.
    pub fn advance_past(&self, id: OperationUnitId) {
        self.next_id.fetch_max(id.value() + 1, Ordering::SeqCst);
    }
}

impl Default for OperationUnitIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
