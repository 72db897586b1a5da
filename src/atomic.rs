//! Atomic operations: groups of logged changes that commit or roll back as
//! one unit.

pub mod id;
pub mod manager;
pub mod operation;
pub mod state;

pub use id::{OperationUnitId, OperationUnitIdGenerator};
pub use manager::{AtomicError, AtomicOperationManager, AtomicResult, CheckpointSnapshot, FreezeGuard};
pub use operation::AtomicOperation;
pub use state::UnitState;
