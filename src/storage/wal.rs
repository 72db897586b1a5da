//! Write-Ahead Logging (WAL) module.
//!
//! This module implements the durable log the recovery engine is built on:
//! - Record model and binary framing with CRC32 checksums
//! - Segment files, rotation and truncation
//! - LSN assignment, buffering and group-commit flushing
//! - Torn-tail detection and repair at open

pub mod manager;
pub mod record;
pub mod segment;

pub use manager::{WalConfig, WalIterator, WalManager, MAX_SEGMENT_SIZE};
pub use record::{
    CheckpointRecord, CompensationRecord, ComponentOperation, Lsn, PageDelta, PageOperation,
    UndoAction, WalRecord, WalRecordHeader, WalRecordPayload, WalRecordType,
};
