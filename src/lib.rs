//! vibewal: write-ahead logging, atomic operations and crash recovery for a
//! paginated storage engine.
//!
//! Changes to pages are grouped into atomic operation units. Each change is
//! logged with its redo and undo image before it is applied; commit forces
//! the unit's records to disk, rollback compensates its changes in reverse.
//! After a crash, [`recovery::AriesRecovery`] replays the log and rolls back
//! the units that never finished. [`engine::Engine`] ties it all together.

pub mod atomic;
pub mod component;
pub mod config;
pub mod engine;
pub mod recovery;
pub mod storage;

pub use atomic::{AtomicError, AtomicOperation, AtomicOperationManager, OperationUnitId, UnitState};
pub use component::{ComponentContext, ComponentError, ComponentId, ComponentRegistry, DurableComponent};
pub use config::{CacheConfig, CheckpointConfig, ConfigError, EngineConfig};
pub use engine::Engine;
pub use storage::wal::{Lsn, PageDelta, WalConfig};
pub use storage::PageId;
