//! WAL record types and their on-disk framing.
//!
//! Every record is framed as
//!
//! ```text
//! [length: u32][kind: u8][unit_id: u64][body][crc32: u32]
//! ```
//!
//! with all integers little endian. `length` counts `kind`, `unit_id` and
//! `body`; the CRC32 covers the same bytes. `body` is the bincode encoding of
//! `(prev_lsn, payload)`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::atomic::id::OperationUnitId;
use crate::component::ComponentId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{check_bounds, PageId};

/// Size of the length prefix.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the fixed part covered by `length` (kind + unit id).
pub const FRAME_FIXED_SIZE: usize = 1 + 8;

/// Size of the CRC32 trailer.
pub const FRAME_CHECKSUM_SIZE: usize = 4;

/// Upper bound for `length`. Anything larger is treated as garbage.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Log Sequence Number: the position of a record in the log.
///
/// LSNs order by segment first, then by byte offset inside the segment.
/// Segments are numbered from 1, so [`Lsn::NULL`] precedes every record.
/// The default is [`Lsn::NULL`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn {
    pub segment: u32,
    pub position: u32,
}

impl Lsn {
    pub const NULL: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    pub const fn new(segment: u32, position: u32) -> Self {
        Self { segment, position }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Packs the LSN into the 8-byte form stored in page trailers.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.segment) << 32) | u64::from(self.position)
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            segment: (raw >> 32) as u32,
            position: raw as u32,
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({}:{})", self.segment, self.position)
    }
}

/// WAL record kinds, as stored in the frame's kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalRecordType {
    UnitStart = 1,
    UnitCommit = 2,
    UnitRollback = 3,
    PageOperation = 4,
    ComponentOperation = 5,
    Compensation = 6,
    Checkpoint = 7,
}

impl WalRecordType {
    pub fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            1 => Self::UnitStart,
            2 => Self::UnitCommit,
            3 => Self::UnitRollback,
            4 => Self::PageOperation,
            5 => Self::ComponentOperation,
            6 => Self::Compensation,
            7 => Self::Checkpoint,
            _ => return None,
        })
    }
}

/// WAL record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecordHeader {
    /// Unit that produced this record.
    pub unit_id: OperationUnitId,
    /// Previous record of the same unit ([`Lsn::NULL`] for a unit start).
    pub prev_lsn: Lsn,
    /// Kind of the record; always agrees with the payload.
    pub record_type: WalRecordType,
}

/// A byte-range image inside a page's payload area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDelta {
    pub offset: u32,
    pub data: Vec<u8>,
}

impl PageDelta {
    /// Creates a delta, checking that it fits the page payload area.
    pub fn new(offset: usize, data: Vec<u8>) -> StorageResult<Self> {
        check_bounds(offset, data.len())?;
        Ok(Self {
            offset: offset as u32,
            data,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A physical change to one page, with both its redo and undo images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOperation {
    pub page_id: PageId,
    pub redo: PageDelta,
    pub undo: PageDelta,
}

impl PageOperation {
    /// Builds a page operation. Both images must cover the same range.
    pub fn new(page_id: PageId, redo: PageDelta, undo: PageDelta) -> StorageResult<Self> {
        if redo.offset != undo.offset || redo.len() != undo.len() {
            return Err(StorageError::DataCorruption(format!(
                "redo and undo images of page {} cover different ranges",
                page_id
            )));
        }
        Ok(Self {
            page_id,
            redo,
            undo,
        })
    }
}

/// A logical change interpreted by a registered durable component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentOperation {
    pub component_id: ComponentId,
    pub redo: Vec<u8>,
    pub undo: Vec<u8>,
}

/// The inverse of one logged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UndoAction {
    Page { page_id: PageId, delta: PageDelta },
    Component { component_id: ComponentId, payload: Vec<u8> },
}

/// Record that an operation has been undone. Never undone itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// The operation this record compensates.
    pub compensated_lsn: Lsn,
    /// Next record of the unit that still needs undoing.
    pub undo_next_lsn: Lsn,
    /// The undo that was applied; redo of this record re-applies it.
    pub action: UndoAction,
}

/// Checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Every record below this LSN has its pages on disk.
    pub cutoff_lsn: Lsn,
    /// Units active when the checkpoint was taken, with their start LSNs.
    pub active_units: Vec<(OperationUnitId, Lsn)>,
}

/// WAL record payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecordPayload {
    UnitStart { metadata: Option<Vec<u8>> },
    UnitCommit,
    UnitRollback,
    PageOperation(PageOperation),
    ComponentOperation(ComponentOperation),
    Compensation(CompensationRecord),
    Checkpoint(CheckpointRecord),
}

impl WalRecordPayload {
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::UnitStart { .. } => WalRecordType::UnitStart,
            Self::UnitCommit => WalRecordType::UnitCommit,
            Self::UnitRollback => WalRecordType::UnitRollback,
            Self::PageOperation(_) => WalRecordType::PageOperation,
            Self::ComponentOperation(_) => WalRecordType::ComponentOperation,
            Self::Compensation(_) => WalRecordType::Compensation,
            Self::Checkpoint(_) => WalRecordType::Checkpoint,
        }
    }

    /// The inverse of this record, for records that can be undone.
    pub fn undo_action(&self) -> Option<UndoAction> {
        match self {
            Self::PageOperation(op) => Some(UndoAction::Page {
                page_id: op.page_id,
                delta: op.undo.clone(),
            }),
            Self::ComponentOperation(op) => Some(UndoAction::Component {
                component_id: op.component_id,
                payload: op.undo.clone(),
            }),
            _ => None,
        }
    }
}

/// Complete WAL record with header and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: WalRecordPayload,
}

impl WalRecord {
    /// Creates a record, deriving the header's kind from the payload.
    pub fn new(unit_id: OperationUnitId, prev_lsn: Lsn, payload: WalRecordPayload) -> Self {
        let header = WalRecordHeader {
            unit_id,
            prev_lsn,
            record_type: payload.record_type(),
        };
        WalRecord { header, payload }
    }

    pub fn unit_start(unit_id: OperationUnitId, metadata: Option<Vec<u8>>) -> Self {
        Self::new(unit_id, Lsn::NULL, WalRecordPayload::UnitStart { metadata })
    }

    pub fn unit_commit(unit_id: OperationUnitId, prev_lsn: Lsn) -> Self {
        Self::new(unit_id, prev_lsn, WalRecordPayload::UnitCommit)
    }

    pub fn unit_rollback(unit_id: OperationUnitId, prev_lsn: Lsn) -> Self {
        Self::new(unit_id, prev_lsn, WalRecordPayload::UnitRollback)
    }

    pub fn page_operation(unit_id: OperationUnitId, prev_lsn: Lsn, op: PageOperation) -> Self {
        Self::new(unit_id, prev_lsn, WalRecordPayload::PageOperation(op))
    }

    pub fn component_operation(
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        op: ComponentOperation,
    ) -> Self {
        Self::new(unit_id, prev_lsn, WalRecordPayload::ComponentOperation(op))
    }

    pub fn compensation(
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        record: CompensationRecord,
    ) -> Self {
        Self::new(unit_id, prev_lsn, WalRecordPayload::Compensation(record))
    }

    /// Checkpoint records belong to the reserved system unit.
    pub fn checkpoint(record: CheckpointRecord) -> Self {
        Self::new(
            OperationUnitId::SYSTEM,
            Lsn::NULL,
            WalRecordPayload::Checkpoint(record),
        )
    }

    pub fn unit_id(&self) -> OperationUnitId {
        self.header.unit_id
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.header.prev_lsn
    }

    /// Encodes the record into a complete frame.
    pub fn encode(&self) -> StorageResult<Bytes> {
        let body = bincode::serialize(&(self.header.prev_lsn, &self.payload))?;
        let length = FRAME_FIXED_SIZE + body.len();
        if length > MAX_RECORD_SIZE {
            return Err(StorageError::Serialization(format!(
                "record of {} bytes exceeds the {} byte limit",
                length, MAX_RECORD_SIZE
            )));
        }

        let mut buf =
            BytesMut::with_capacity(FRAME_LENGTH_SIZE + length + FRAME_CHECKSUM_SIZE);
        buf.put_u32_le(length as u32);
        buf.put_u8(self.header.record_type as u8);
        buf.put_u64_le(self.header.unit_id.value());
        buf.put_slice(&body);
        let crc = crc32fast::hash(&buf[FRAME_LENGTH_SIZE..]);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Decodes the part of a frame covered by `length`, after its checksum
    /// has been verified.
    pub fn decode(content: &[u8]) -> StorageResult<Self> {
        if content.len() < FRAME_FIXED_SIZE {
            return Err(StorageError::DataCorruption(format!(
                "record content of {} bytes is shorter than its header",
                content.len()
            )));
        }
        let kind = content[0];
        let mut unit = [0u8; 8];
        unit.copy_from_slice(&content[1..FRAME_FIXED_SIZE]);
        let unit_id = OperationUnitId::new(u64::from_le_bytes(unit));

        let record_type = WalRecordType::from_u8(kind).ok_or_else(|| {
            StorageError::DataCorruption(format!("unknown record kind {}", kind))
        })?;
        let (prev_lsn, payload): (Lsn, WalRecordPayload) =
            bincode::deserialize(&content[FRAME_FIXED_SIZE..])?;
        if payload.record_type() != record_type {
            return Err(StorageError::DataCorruption(format!(
                "record kind {:?} does not match its payload {:?}",
                record_type,
                payload.record_type()
            )));
        }

        Ok(WalRecord {
            header: WalRecordHeader {
                unit_id,
                prev_lsn,
                record_type,
            },
            payload,
        })
    }
}

/// Total on-disk size of a frame whose `length` field is `length`.
pub fn frame_size(length: usize) -> usize {
    FRAME_LENGTH_SIZE + length + FRAME_CHECKSUM_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: u64) -> OperationUnitId {
        OperationUnitId::new(id)
    }

    fn page_op(offset: usize, redo: &[u8], undo: &[u8]) -> PageOperation {
        PageOperation::new(
            PageId::new(1, 3),
            PageDelta::new(offset, redo.to_vec()).unwrap(),
            PageDelta::new(offset, undo.to_vec()).unwrap(),
        )
        .unwrap()
    }

    fn content(frame: &[u8]) -> &[u8] {
        &frame[FRAME_LENGTH_SIZE..frame.len() - FRAME_CHECKSUM_SIZE]
    }

    #[test]
    fn test_lsn_ordering_and_packing() {
        assert!(Lsn::NULL < Lsn::new(1, 0));
        assert!(Lsn::new(1, 900) < Lsn::new(2, 0));
        assert!(Lsn::NULL.is_null());

        let lsn = Lsn::new(7, 4242);
        assert_eq!(Lsn::from_u64(lsn.to_u64()), lsn);
        assert_eq!(lsn.to_string(), "LSN(7:4242)");
    }

    #[test]
    fn test_frame_layout() {
        let record = WalRecord::unit_commit(unit(9), Lsn::new(1, 40));
        let frame = record.encode().unwrap();

        let length = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), frame_size(length));
        assert_eq!(frame[4], WalRecordType::UnitCommit as u8);
        assert_eq!(u64::from_le_bytes(frame[5..13].try_into().unwrap()), 9);

        let crc = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(content(&frame)));
    }

    #[test]
    fn test_every_payload_survives_framing() {
        let records = vec![
            WalRecord::unit_start(unit(1), Some(b"meta".to_vec())),
            WalRecord::unit_start(unit(2), None),
            WalRecord::page_operation(unit(1), Lsn::new(1, 0), page_op(16, b"new", b"old")),
            WalRecord::component_operation(
                unit(1),
                Lsn::new(1, 60),
                ComponentOperation {
                    component_id: ComponentId(4),
                    redo: vec![1, 2, 3],
                    undo: vec![3, 2, 1],
                },
            ),
            WalRecord::compensation(
                unit(1),
                Lsn::new(1, 120),
                CompensationRecord {
                    compensated_lsn: Lsn::new(1, 60),
                    undo_next_lsn: Lsn::new(1, 0),
                    action: UndoAction::Page {
                        page_id: PageId::new(1, 3),
                        delta: PageDelta::new(16, b"old".to_vec()).unwrap(),
                    },
                },
            ),
            WalRecord::unit_rollback(unit(1), Lsn::new(1, 200)),
            WalRecord::checkpoint(CheckpointRecord {
                cutoff_lsn: Lsn::new(1, 0),
                active_units: vec![(unit(2), Lsn::new(1, 30))],
            }),
        ];

        for record in records {
            let frame = record.encode().unwrap();
            let decoded = WalRecord::decode(content(&frame)).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_kind_must_match_payload() {
        let record = WalRecord::unit_commit(unit(1), Lsn::new(1, 0));
        let frame = record.encode().unwrap();
        let mut tampered = content(&frame).to_vec();
        tampered[0] = WalRecordType::UnitRollback as u8;

        let err = WalRecord::decode(&tampered).unwrap_err();
        assert!(err.is_corruption());

        tampered[0] = 200;
        assert!(WalRecord::decode(&tampered).unwrap_err().is_corruption());
    }

    #[test]
    fn test_page_operation_ranges() {
        let page_id = PageId::new(0, 0);
        let redo = PageDelta::new(0, vec![1, 2]).unwrap();
        let undo = PageDelta::new(1, vec![0, 0]).unwrap();
        assert!(PageOperation::new(page_id, redo, undo).is_err());

        assert!(matches!(
            PageDelta::new(crate::storage::page::PAGE_PAYLOAD_SIZE, vec![1]),
            Err(StorageError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_undo_action_of_payloads() {
        let payload = WalRecordPayload::PageOperation(page_op(8, b"ab", b"xy"));
        assert_eq!(
            payload.undo_action(),
            Some(UndoAction::Page {
                page_id: PageId::new(1, 3),
                delta: PageDelta::new(8, b"xy".to_vec()).unwrap(),
            })
        );
        assert_eq!(WalRecordPayload::UnitCommit.undo_action(), None);
    }
}
