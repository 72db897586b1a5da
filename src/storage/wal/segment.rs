//! WAL segment files and the frame reader.
//!
//! The log is a sequence of segment files named `wal_<segment:010>.log`.
//! [`SegmentReader`] walks the frames of one segment and reports how it
//! stopped, so callers can tell a clean end from a torn tail or a damaged
//! record.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::record::{
    frame_size, Lsn, WalRecord, FRAME_CHECKSUM_SIZE, FRAME_FIXED_SIZE, FRAME_LENGTH_SIZE,
    MAX_RECORD_SIZE,
};
use crate::storage::error::StorageResult;

/// WAL file prefix.
const WAL_FILE_PREFIX: &str = "wal_";

/// WAL file extension.
const WAL_FILE_EXTENSION: &str = ".log";

/// Path of a segment file inside `dir`.
pub fn segment_path(dir: &Path, segment: u32) -> PathBuf {
    dir.join(format!(
        "{}{:010}{}",
        WAL_FILE_PREFIX, segment, WAL_FILE_EXTENSION
    ))
}

fn parse_segment_id(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_EXTENSION)?
        .parse()
        .ok()
}

/// Lists the segment ids present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> StorageResult<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Result of reading one frame.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A valid record and its LSN.
    Record(Lsn, WalRecord),
    /// Clean end of the readable range.
    Eof,
    /// The frame at `position` is incomplete or has an implausible length.
    TornWrite { position: u32, reason: String },
    /// The frame at `position` failed its CRC32 check.
    ChecksumMismatch { position: u32 },
    /// The frame at `position` passed its checksum but could not be decoded.
    Malformed { position: u32, reason: String },
}

/// Sequential reader over the frames of one segment.
pub struct SegmentReader {
    segment: u32,
    reader: BufReader<File>,
    position: u64,
    limit: u64,
}

impl SegmentReader {
    /// Opens `segment` and positions the reader at `position`. Reading stops at
    /// `limit`, or at the end of the file when no limit is given.
    pub fn open(
        dir: &Path,
        segment: u32,
        position: u32,
        limit: Option<u32>,
    ) -> StorageResult<Self> {
        let file = File::open(segment_path(dir, segment))?;
        let file_len = file.metadata()?.len();
        let limit = match limit {
            Some(limit) => u64::from(limit).min(file_len),
            None => file_len,
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(u64::from(position)))?;

        Ok(Self {
            segment,
            reader,
            position: u64::from(position),
            limit,
        })
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Offset of the next frame.
    pub fn position(&self) -> u32 {
        self.position as u32
    }

    /// Reads the next frame.
    pub fn read_next(&mut self) -> StorageResult<ReadOutcome> {
        let start = self.position as u32;
        let remaining = self.limit.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if remaining < FRAME_LENGTH_SIZE as u64 {
            return Ok(ReadOutcome::TornWrite {
                position: start,
                reason: format!("incomplete length prefix: {} bytes remaining", remaining),
            });
        }

        let length = self.reader.read_u32::<LittleEndian>()? as usize;
        if !(FRAME_FIXED_SIZE..=MAX_RECORD_SIZE).contains(&length) {
            return Ok(ReadOutcome::TornWrite {
                position: start,
                reason: format!("implausible record length {}", length),
            });
        }
        let needed = frame_size(length) as u64;
        if remaining < needed {
            return Ok(ReadOutcome::TornWrite {
                position: start,
                reason: format!(
                    "incomplete record: {} bytes remaining, need {}",
                    remaining, needed
                ),
            });
        }

        let mut content = vec![0u8; length];
        self.reader.read_exact(&mut content)?;
        let expected = self.reader.read_u32::<LittleEndian>()?;
        self.position += (FRAME_LENGTH_SIZE + length + FRAME_CHECKSUM_SIZE) as u64;

        if crc32fast::hash(&content) != expected {
            return Ok(ReadOutcome::ChecksumMismatch { position: start });
        }

        match WalRecord::decode(&content) {
            Ok(record) => Ok(ReadOutcome::Record(Lsn::new(self.segment, start), record)),
            Err(e) => Ok(ReadOutcome::Malformed {
                position: start,
                reason: e.to_string(),
            }),
        }
    }
}

/// Returns the position of the first intact frame that starts after `from`
/// in `segment`. The frame at `from` itself is skipped, since it is the one
/// found damaged.
pub fn find_intact_frame(dir: &Path, segment: u32, from: u32) -> StorageResult<Option<u32>> {
    let mut file = File::open(segment_path(dir, segment))?;
    file.seek(SeekFrom::Start(u64::from(from)))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    Ok((1..tail.len())
        .find(|&offset| is_intact_frame(&tail[offset..]))
        .map(|offset| from + offset as u32))
}

fn is_intact_frame(bytes: &[u8]) -> bool {
    if bytes.len() < FRAME_LENGTH_SIZE {
        return false;
    }
    let length = LittleEndian::read_u32(&bytes[..FRAME_LENGTH_SIZE]) as usize;
    if !(FRAME_FIXED_SIZE..=MAX_RECORD_SIZE).contains(&length) || bytes.len() < frame_size(length) {
        return false;
    }
    let content = &bytes[FRAME_LENGTH_SIZE..FRAME_LENGTH_SIZE + length];
    let checksum = LittleEndian::read_u32(&bytes[FRAME_LENGTH_SIZE + length..frame_size(length)]);
    crc32fast::hash(content) == checksum && WalRecord::decode(content).is_ok()
}
