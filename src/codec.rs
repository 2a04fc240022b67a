//! Binary codec for StrandDB chunk files.
//!
//! This module handles serialization and deserialization of chunk headers and
//! individual log records. It is pure data transformation -- no file I/O, no
//! async, no index management.
//!
//! A chunk file starts with a fixed 24-byte header (magic, format version,
//! chunk number, configured chunk size). Each record that follows is a
//! length-prefixed, CRC32-checksummed frame:
//!
//! ```text
//! record_length u32 | kind u8 | flags u8 | log_position i64 |
//! transaction_position i64 | kind-specific fields | crc32 u32
//! ```
//!
//! `record_length` counts everything after itself, checksum included. The
//! CRC covers everything between the length prefix and the checksum.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::Error;

/// Magic bytes identifying a StrandDB chunk file (ASCII "STRC").
const MAGIC: [u8; 4] = *b"STRC";

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Size of the chunk file header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 24;

/// Size of the length prefix field in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the trailing checksum in bytes.
const CHECKSUM_SIZE: usize = 4;

/// kind(1) + flags(1) + log_position(8) + transaction_position(8).
const COMMON_FIELDS_SIZE: usize = 1 + 1 + 8 + 8;

/// Record flag bits.
pub mod flags {
    /// First record of a transaction.
    pub const TRANSACTION_BEGIN: u8 = 0x01;
    /// Last record of a transaction.
    pub const TRANSACTION_END: u8 = 0x02;
    /// Event payload is JSON.
    pub const IS_JSON: u8 = 0x04;
    /// Event is a stream tombstone.
    pub const STREAM_DELETE: u8 = 0x08;
}

const KIND_STREAM_NAME: u8 = 1;
const KIND_EVENT_TYPE: u8 = 2;
const KIND_EVENT: u8 = 3;
const KIND_EMPTY: u8 = 4;

/// Result of attempting to decode a value from a byte buffer.
///
/// A truncated trailing frame is expected after an unclean shutdown and is
/// reported as `Incomplete`; a checksum mismatch is an error.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// Decoded chunk file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Zero-based sequence number of the chunk.
    pub chunk_number: u64,
    /// Data capacity of every chunk in the log, in bytes.
    pub chunk_size: u64,
}

/// One record in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Global log position of this record.
    pub log_position: i64,
    /// Position of the first record of the transaction this record belongs to.
    pub transaction_position: i64,
    /// Combination of [`flags`] bits.
    pub flags: u8,
    /// Kind-specific content.
    pub body: RecordBody,
}

/// Kind-specific content of a [`LogRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Assigns a compact id to a stream name.
    StreamName { id: u32, name: String },
    /// Assigns a compact id to an event type name.
    EventType { id: u32, name: String },
    /// One event written to a stream.
    Event {
        stream_id: u32,
        event_number: i64,
        event_id: Uuid,
        event_type_id: u32,
        metadata: Bytes,
        payload: Bytes,
    },
    /// Data-less marker of an empty single-stream write.
    Empty { stream_id: u32 },
}

impl LogRecord {
    /// Create a record with positions left at zero; the log writer assigns them.
    pub fn unpositioned(flags: u8, body: RecordBody) -> Self {
        Self {
            log_position: 0,
            transaction_position: 0,
            flags,
            body,
        }
    }

    /// Whether the record has the given flag bit set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Encode a chunk header as a fixed 24-byte array.
pub fn encode_chunk_header(header: ChunkHeader) -> [u8; CHUNK_HEADER_SIZE] {
    let mut buf = [0u8; CHUNK_HEADER_SIZE];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&header.chunk_number.to_le_bytes());
    buf[16..24].copy_from_slice(&header.chunk_size.to_le_bytes());
    buf
}

/// Decode and validate a chunk header.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] if the buffer is too short, the magic
/// number is wrong or the format version is unsupported.
pub fn decode_chunk_header(buf: &[u8]) -> Result<ChunkHeader, Error> {
    if buf.len() < CHUNK_HEADER_SIZE {
        return Err(Error::InvalidHeader(format!(
            "chunk too short for header: {} bytes",
            buf.len()
        )));
    }
    if buf[0..4] != MAGIC {
        return Err(Error::InvalidHeader(
            "wrong magic bytes: expected STRC".to_string(),
        ));
    }
    let mut cursor = Cursor::new(&buf[4..CHUNK_HEADER_SIZE], 0);
    let version = cursor.u32().map_err(header_error)?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidHeader(format!(
            "unsupported format version: {version}"
        )));
    }
    let chunk_number = cursor.u64().map_err(header_error)?;
    let chunk_size = cursor.u64().map_err(header_error)?;
    Ok(ChunkHeader {
        chunk_number,
        chunk_size,
    })
}

fn header_error(err: Error) -> Error {
    Error::InvalidHeader(err.to_string())
}

/// Number of bytes `record` occupies on disk.
///
/// Positions are fixed-width, so the size is known before the log writer
/// assigns them.
pub fn encoded_len(record: &LogRecord) -> usize {
    LENGTH_PREFIX_SIZE + COMMON_FIELDS_SIZE + body_len(&record.body) + CHECKSUM_SIZE
}

fn body_len(body: &RecordBody) -> usize {
    match body {
        RecordBody::StreamName { name, .. } | RecordBody::EventType { name, .. } => {
            4 + 2 + name.len()
        }
        RecordBody::Event {
            metadata, payload, ..
        } => 4 + 8 + 16 + 4 + 4 + metadata.len() + 4 + payload.len(),
        RecordBody::Empty { .. } => 4,
    }
}

/// Append the binary frame of `record` to `buf`.
pub fn encode_record(record: &LogRecord, buf: &mut Vec<u8>) {
    let start = buf.len();
    let frame_len = encoded_len(record);
    buf.reserve(frame_len);
    buf.extend_from_slice(&((frame_len - LENGTH_PREFIX_SIZE) as u32).to_le_bytes());

    buf.push(kind_of(&record.body));
    buf.push(record.flags);
    buf.extend_from_slice(&record.log_position.to_le_bytes());
    buf.extend_from_slice(&record.transaction_position.to_le_bytes());

    match &record.body {
        RecordBody::StreamName { id, name } | RecordBody::EventType { id, name } => {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        RecordBody::Event {
            stream_id,
            event_number,
            event_id,
            event_type_id,
            metadata,
            payload,
        } => {
            buf.extend_from_slice(&stream_id.to_le_bytes());
            buf.extend_from_slice(&event_number.to_le_bytes());
            buf.extend_from_slice(event_id.as_bytes());
            buf.extend_from_slice(&event_type_id.to_le_bytes());
            buf.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
            buf.extend_from_slice(metadata);
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(payload);
        }
        RecordBody::Empty { stream_id } => {
            buf.extend_from_slice(&stream_id.to_le_bytes());
        }
    }

    let crc = crc32fast::hash(&buf[start + LENGTH_PREFIX_SIZE..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

fn kind_of(body: &RecordBody) -> u8 {
    match body {
        RecordBody::StreamName { .. } => KIND_STREAM_NAME,
        RecordBody::EventType { .. } => KIND_EVENT_TYPE,
        RecordBody::Event { .. } => KIND_EVENT,
        RecordBody::Empty { .. } => KIND_EMPTY,
    }
}

/// Decode a single record from the start of a byte buffer.
///
/// `position` is the log position the frame was read from; it is only used
/// in error reports.
///
/// # Returns
///
/// [`DecodeOutcome::Incomplete`] when the buffer is shorter than the frame
/// announced by its length prefix (or shorter than the prefix itself).
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the checksum does not match, the kind
/// is unknown or a field is malformed.
pub fn decode_record(buf: &[u8], position: i64) -> Result<DecodeOutcome<LogRecord>, Error> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }
    let record_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = LENGTH_PREFIX_SIZE + record_length;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }
    if record_length < COMMON_FIELDS_SIZE + CHECKSUM_SIZE {
        return Err(Error::CorruptRecord {
            position,
            detail: format!("record length {record_length} too short"),
        });
    }

    let frame = &buf[LENGTH_PREFIX_SIZE..total];
    let crc_offset = frame.len() - CHECKSUM_SIZE;
    let stored_crc = u32::from_le_bytes([
        frame[crc_offset],
        frame[crc_offset + 1],
        frame[crc_offset + 2],
        frame[crc_offset + 3],
    ]);
    let protected = &frame[..crc_offset];
    let computed_crc = crc32fast::hash(protected);
    if stored_crc != computed_crc {
        return Err(Error::CorruptRecord {
            position,
            detail: format!(
                "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
            ),
        });
    }

    let mut cursor = Cursor::new(protected, position);
    let kind = cursor.u8()?;
    let flags = cursor.u8()?;
    let log_position = cursor.i64()?;
    let transaction_position = cursor.i64()?;

    let body = match kind {
        KIND_STREAM_NAME => {
            let (id, name) = cursor.named()?;
            RecordBody::StreamName { id, name }
        }
        KIND_EVENT_TYPE => {
            let (id, name) = cursor.named()?;
            RecordBody::EventType { id, name }
        }
        KIND_EVENT => {
            let stream_id = cursor.u32()?;
            let event_number = cursor.i64()?;
            let event_id = Uuid::from_slice(cursor.take(16)?).map_err(|e| cursor.corrupt(e))?;
            let event_type_id = cursor.u32()?;
            let metadata_len = cursor.u32()? as usize;
            let metadata = Bytes::copy_from_slice(cursor.take(metadata_len)?);
            let payload_len = cursor.u32()? as usize;
            let payload = Bytes::copy_from_slice(cursor.take(payload_len)?);
            RecordBody::Event {
                stream_id,
                event_number,
                event_id,
                event_type_id,
                metadata,
                payload,
            }
        }
        KIND_EMPTY => RecordBody::Empty {
            stream_id: cursor.u32()?,
        },
        other => {
            return Err(Error::CorruptRecord {
                position,
                detail: format!("unknown record kind {other}"),
            });
        }
    };
    cursor.finish()?;

    Ok(DecodeOutcome::Complete {
        value: LogRecord {
            log_position,
            transaction_position,
            flags,
            body,
        },
        consumed: total,
    })
}

/// Little-endian reader over a CRC-verified record body.
struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
    position: i64,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], position: i64) -> Self {
        Self {
            buf,
            offset: 0,
            position,
        }
    }

    fn corrupt(&self, detail: impl std::fmt::Display) -> Error {
        Error::CorruptRecord {
            position: self.position,
            detail: detail.to_string(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.corrupt("unexpected end of record body"))?;
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// `id u32 | name_len u16 | name` as used by registration records.
    fn named(&mut self) -> Result<(u32, String), Error> {
        let id = self.u32()?;
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| self.corrupt(format!("invalid UTF-8 in name: {e}")))?;
        Ok((id, name.to_string()))
    }

    fn finish(&self) -> Result<(), Error> {
        if self.offset != self.buf.len() {
            return Err(self.corrupt(format!(
                "{} trailing bytes in record body",
                self.buf.len() - self.offset
            )));
        }
        Ok(())
    }
}
