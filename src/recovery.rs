//! Recovery and crash resilience module.
//!
//! This module handles bringing the storage back to a consistent state:
//! - Applying logged operations, shared with forward processing
//! - Checkpoint management and log truncation
//! - Crash recovery (analysis, redo, undo)

pub mod apply;
pub mod aries;
pub mod checkpoint;

// Re-export commonly used types
pub use aries::{AriesRecovery, RecoveryError, RecoveryStats};
pub use checkpoint::{CheckpointError, CheckpointManager, CheckpointMarker, Checkpointer};
