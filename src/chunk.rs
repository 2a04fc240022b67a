//! Position-addressed, append-only log split into fixed-size chunk files.
//!
//! The log lives in a directory of `chunk-NNNNNN.dat` files. Every chunk holds
//! at most `chunk_size` bytes of records after its header, and the global log
//! position of a byte is `chunk_number * chunk_size + offset_in_chunk`. A
//! sealed chunk may end short of `chunk_size`; positions simply skip the gap.
//!
//! Opening the log recovers it: the tail of the last chunk is truncated when it
//! holds an incomplete or corrupt frame, or the records of a transaction whose
//! end marker never reached disk.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, CHUNK_HEADER_SIZE, ChunkHeader, DecodeOutcome, LogRecord, flags};
use crate::error::Error;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: u64 = 1024;

/// A record recovered from disk together with the position just past it.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The decoded record.
    pub record: LogRecord,
    /// Log position of the byte after the record.
    pub next_position: i64,
}

/// Result of [`ChunkedLog::open`].
pub struct RecoveredLog {
    /// The log, positioned at its recovered end.
    pub log: ChunkedLog,
    /// Every complete transaction's records, in log order.
    pub entries: Vec<LogEntry>,
}

/// The writable end of the log.
///
/// Only the writer task holds a `ChunkedLog`; there is no concurrent access.
pub struct ChunkedLog {
    dir: PathBuf,
    chunk_size: u64,
    chunk_number: u64,
    file: File,
    /// Bytes of record data in the current chunk (header excluded).
    offset: u64,
}

fn chunk_path(dir: &Path, chunk_number: u64) -> PathBuf {
    dir.join(format!("chunk-{chunk_number:06}.dat"))
}

fn parse_chunk_number(name: &str) -> Option<u64> {
    name.strip_prefix("chunk-")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

fn sync_dir(dir: &Path) -> Result<(), Error> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Whether a frame that decodes at its own position exists after `start`.
///
/// Distinguishes a torn tail (nothing valid follows) from corruption in the
/// middle of the chunk.
fn has_valid_record_after(data: &[u8], start: usize, base: i64) -> bool {
    for at in (start + 1)..data.len() {
        let pos = base + (at - CHUNK_HEADER_SIZE) as i64;
        if let Ok(DecodeOutcome::Complete { value, .. }) = codec::decode_record(&data[at..], pos)
        {
            if value.log_position == pos {
                return true;
            }
        }
    }
    false
}

impl ChunkedLog {
    /// Open or create the log in `dir`.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding the chunk files. Created if missing.
    /// * `chunk_size` - Data capacity of each chunk. Must match the size the
    ///   existing chunks were created with.
    ///
    /// # Returns
    ///
    /// The log positioned at its end plus every record of every complete
    /// transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `chunk_size` is below [`MIN_CHUNK_SIZE`].
    /// - [`Error::InvalidHeader`] if a chunk header is malformed, a chunk is
    ///   missing, or the chunk size differs from `chunk_size`.
    /// - [`Error::CorruptRecord`] if corruption is found anywhere except the
    ///   tail of the last chunk.
    /// - [`Error::Io`] on filesystem failures.
    pub fn open(dir: &Path, chunk_size: u64) -> Result<RecoveredLog, Error> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "chunk size {chunk_size} is below the {MIN_CHUNK_SIZE} byte minimum"
            )));
        }
        fs::create_dir_all(dir)?;

        let mut numbers = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(n) = entry.file_name().to_str().and_then(parse_chunk_number) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();

        if numbers.is_empty() {
            let log = Self::create_chunk(dir, chunk_size, 0)?;
            tracing::info!(dir = %dir.display(), chunk_size, "created new log");
            return Ok(RecoveredLog {
                log,
                entries: Vec::new(),
            });
        }

        for (expected, actual) in numbers.iter().enumerate() {
            if *actual != expected as u64 {
                return Err(Error::InvalidHeader(format!(
                    "chunk {expected} is missing from {}",
                    dir.display()
                )));
            }
        }

        let last_number = numbers.len() as u64 - 1;
        let mut entries = Vec::new();
        let mut tail_end = CHUNK_HEADER_SIZE;

        for &number in &numbers {
            let is_last = number == last_number;
            let data = fs::read(chunk_path(dir, number))?;
            let header = codec::decode_chunk_header(&data)?;
            if header.chunk_number != number {
                return Err(Error::InvalidHeader(format!(
                    "chunk file {number} declares chunk number {}",
                    header.chunk_number
                )));
            }
            if header.chunk_size != chunk_size {
                return Err(Error::InvalidHeader(format!(
                    "chunk {number} was written with chunk size {}, configured {chunk_size}",
                    header.chunk_size
                )));
            }

            let end = Self::scan_chunk(&data, number, chunk_size, is_last, &mut entries)?;
            if is_last {
                tail_end = end;
            }
        }

        // Records after the last transaction end belong to a write that never
        // finished. They can only sit in the last chunk.
        let complete = entries
            .iter()
            .rposition(|e| e.record.has_flag(flags::TRANSACTION_END))
            .map_or(0, |i| i + 1);
        if complete < entries.len() {
            let last_base = (last_number * chunk_size) as i64;
            let first_partial = entries[complete].record.log_position;
            if first_partial < last_base {
                return Err(Error::CorruptRecord {
                    position: first_partial,
                    detail: "unterminated transaction in sealed chunk".to_string(),
                });
            }
            tracing::warn!(
                position = first_partial,
                records = entries.len() - complete,
                "truncating partially written transaction"
            );
            tail_end = CHUNK_HEADER_SIZE + (first_partial - last_base) as usize;
            entries.truncate(complete);
        }

        let path = chunk_path(dir, last_number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() != tail_end as u64 {
            file.set_len(tail_end as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        let log = ChunkedLog {
            dir: dir.to_path_buf(),
            chunk_size,
            chunk_number: last_number,
            file,
            offset: (tail_end - CHUNK_HEADER_SIZE) as u64,
        };
        tracing::info!(
            chunks = numbers.len(),
            records = entries.len(),
            write_position = log.write_position(),
            "recovered log"
        );
        Ok(RecoveredLog { log, entries })
    }

    /// Decode the records of one chunk into `entries`.
    ///
    /// Returns the file offset just past the last good record.
    fn scan_chunk(
        data: &[u8],
        number: u64,
        chunk_size: u64,
        is_last: bool,
        entries: &mut Vec<LogEntry>,
    ) -> Result<usize, Error> {
        let base = (number * chunk_size) as i64;
        let mut offset = CHUNK_HEADER_SIZE;

        while offset < data.len() {
            let position = base + (offset - CHUNK_HEADER_SIZE) as i64;
            match codec::decode_record(&data[offset..], position) {
                Ok(DecodeOutcome::Complete { value, consumed }) => {
                    if value.log_position != position {
                        return Err(Error::CorruptRecord {
                            position,
                            detail: format!("record claims position {}", value.log_position),
                        });
                    }
                    if (offset - CHUNK_HEADER_SIZE + consumed) as u64 > chunk_size {
                        return Err(Error::CorruptRecord {
                            position,
                            detail: "record crosses the chunk boundary".to_string(),
                        });
                    }
                    offset += consumed;
                    entries.push(LogEntry {
                        record: value,
                        next_position: position + consumed as i64,
                    });
                }
                Ok(DecodeOutcome::Incomplete) => {
                    if !is_last {
                        return Err(Error::CorruptRecord {
                            position,
                            detail: format!("incomplete record in sealed chunk {number}"),
                        });
                    }
                    if has_valid_record_after(data, offset, base) {
                        return Err(Error::CorruptRecord {
                            position,
                            detail: "length prefix runs past valid records".to_string(),
                        });
                    }
                    tracing::warn!(
                        position,
                        bytes = data.len() - offset,
                        "truncating incomplete trailing record"
                    );
                    break;
                }
                Err(Error::CorruptRecord { detail, .. }) => {
                    if !is_last || has_valid_record_after(data, offset, base) {
                        return Err(Error::CorruptRecord { position, detail });
                    }
                    tracing::warn!(
                        position,
                        bytes = data.len() - offset,
                        %detail,
                        "truncating corrupt trailing data"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(offset)
    }

    fn create_chunk(dir: &Path, chunk_size: u64, chunk_number: u64) -> Result<ChunkedLog, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(chunk_path(dir, chunk_number))?;
        file.write_all(&codec::encode_chunk_header(ChunkHeader {
            chunk_number,
            chunk_size,
        }))?;
        file.sync_all()?;
        sync_dir(dir)?;
        Ok(ChunkedLog {
            dir: dir.to_path_buf(),
            chunk_size,
            chunk_number,
            file,
            offset: 0,
        })
    }

    /// Position the next appended byte will occupy.
    pub fn write_position(&self) -> i64 {
        (self.chunk_number * self.chunk_size + self.offset) as i64
    }

    /// Bytes still available in the current chunk.
    pub fn remaining(&self) -> u64 {
        self.chunk_size - self.offset
    }

    /// Data capacity of one chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Append `bytes` at `position`, which must equal [`Self::write_position`].
    ///
    /// # Returns
    ///
    /// The new write position.
    ///
    /// # Errors
    ///
    /// - [`Error::PositionMismatch`] if `position` is not the write position.
    /// - [`Error::InvalidArgument`] if `bytes` does not fit in the current chunk.
    /// - [`Error::Io`] if the write fails.
    pub fn append_at(&mut self, position: i64, bytes: &[u8]) -> Result<i64, Error> {
        let expected = self.write_position();
        if position != expected {
            return Err(Error::PositionMismatch {
                expected,
                actual: position,
            });
        }
        if bytes.len() as u64 > self.remaining() {
            return Err(Error::InvalidArgument(format!(
                "write of {} bytes exceeds the {} bytes left in chunk {}",
                bytes.len(),
                self.remaining(),
                self.chunk_number
            )));
        }
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(self.write_position())
    }

    /// Seal the current chunk and continue in a fresh one.
    ///
    /// # Returns
    ///
    /// The write position at the start of the new chunk.
    pub fn seal_and_roll(&mut self) -> Result<i64, Error> {
        self.file.sync_all()?;
        let next = Self::create_chunk(&self.dir, self.chunk_size, self.chunk_number + 1)?;
        tracing::info!(
            sealed = self.chunk_number,
            unused = self.remaining(),
            "sealed chunk"
        );
        *self = next;
        Ok(self.write_position())
    }

    /// Make everything appended so far durable.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RecordBody, encode_record, encoded_len};

    const CHUNK: u64 = 1024;

    /// Write a transaction of `count` empty-marker records and return its end.
    fn write_txn(log: &mut ChunkedLog, count: usize) -> i64 {
        let start = log.write_position();
        let mut buf = Vec::new();
        let mut pos = start;
        for i in 0..count {
            let mut f = 0;
            if i == 0 {
                f |= flags::TRANSACTION_BEGIN;
            }
            if i + 1 == count {
                f |= flags::TRANSACTION_END;
            }
            let record = LogRecord {
                log_position: pos,
                transaction_position: start,
                flags: f,
                body: RecordBody::Empty { stream_id: i as u32 },
            };
            pos += encoded_len(&record) as i64;
            encode_record(&record, &mut buf);
        }
        log.append_at(start, &buf).expect("append should succeed")
    }

    fn chunk_file(dir: &Path, n: u64) -> PathBuf {
        chunk_path(dir, n)
    }

    #[test]
    fn open_creates_first_chunk() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("open should succeed");
        assert!(recovered.entries.is_empty());
        assert_eq!(recovered.log.write_position(), 0);
        assert_eq!(recovered.log.remaining(), CHUNK);
        assert!(chunk_file(dir.path(), 0).exists());
    }

    #[test]
    fn reopen_recovers_written_records() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let end = {
            let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
            write_txn(&mut log, 2);
            let end = write_txn(&mut log, 1);
            log.flush().expect("flush");
            end
        };

        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("reopen should succeed");
        assert_eq!(recovered.entries.len(), 3);
        assert_eq!(recovered.log.write_position(), end);
        assert_eq!(recovered.entries[2].next_position, end);
    }

    #[test]
    fn append_at_wrong_position_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
        match log.append_at(5, b"abc") {
            Err(Error::PositionMismatch { expected, actual }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 5);
            }
            other => panic!("expected PositionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn append_larger_than_remaining_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
        let big = vec![0u8; CHUNK as usize + 1];
        assert!(matches!(
            log.append_at(0, &big),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(log.write_position(), 0);
    }

    #[test]
    fn seal_and_roll_moves_to_next_chunk_boundary() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
        write_txn(&mut log, 1);
        let next = log.seal_and_roll().expect("roll should succeed");
        assert_eq!(next, CHUNK as i64);
        let end = write_txn(&mut log, 2);
        log.flush().expect("flush");
        drop(log);

        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("reopen");
        assert_eq!(recovered.entries.len(), 3);
        assert_eq!(recovered.entries[1].record.log_position, CHUNK as i64);
        assert_eq!(recovered.log.write_position(), end);
    }

    #[test]
    fn trailing_garbage_is_truncated() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let end = {
            let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
            let end = write_txn(&mut log, 1);
            log.flush().expect("flush");
            end
        };
        let path = chunk_file(dir.path(), 0);
        let mut data = fs::read(&path).expect("read chunk");
        data.extend_from_slice(&[0xAB; 7]);
        fs::write(&path, &data).expect("write chunk");

        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("recovery should succeed");
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(recovered.log.write_position(), end);
        let len = fs::metadata(&path).expect("metadata").len();
        assert_eq!(len, CHUNK_HEADER_SIZE as u64 + end as u64);
    }

    #[test]
    fn corruption_followed_by_valid_record_is_fatal() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        {
            let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
            write_txn(&mut log, 1);
            write_txn(&mut log, 1);
            log.flush().expect("flush");
        }
        let path = chunk_file(dir.path(), 0);
        let mut data = fs::read(&path).expect("read chunk");
        // Flip a bit inside the first record's checksummed region.
        data[CHUNK_HEADER_SIZE + 6] ^= 0x01;
        fs::write(&path, &data).expect("write chunk");

        match ChunkedLog::open(dir.path(), CHUNK) {
            Err(Error::CorruptRecord { position, .. }) => assert_eq!(position, 0),
            Err(other) => panic!("expected CorruptRecord, got {other:?}"),
            Ok(_) => panic!("expected CorruptRecord, got Ok"),
        }
    }

    #[test]
    fn damaged_length_prefix_before_valid_record_is_fatal() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        {
            let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
            write_txn(&mut log, 1);
            write_txn(&mut log, 1);
            log.flush().expect("flush");
        }
        let path = chunk_file(dir.path(), 0);
        let mut data = fs::read(&path).expect("read chunk");
        let len_before = data.len();
        // A length far past the end of the file reads as a torn record.
        data[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + 4]
            .copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
        fs::write(&path, &data).expect("write chunk");

        match ChunkedLog::open(dir.path(), CHUNK) {
            Err(Error::CorruptRecord { position, .. }) => assert_eq!(position, 0),
            Err(other) => panic!("expected CorruptRecord, got {other:?}"),
            Ok(_) => panic!("expected CorruptRecord, got Ok"),
        }
        let len_after = fs::metadata(&path).expect("metadata").len() as usize;
        assert_eq!(len_after, len_before, "chunk must not be truncated");
    }

    #[test]
    fn unterminated_transaction_is_truncated() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let first_end = {
            let mut log = ChunkedLog::open(dir.path(), CHUNK).expect("open").log;
            let end = write_txn(&mut log, 1);
            // A begin record with no end marker.
            let record = LogRecord {
                log_position: end,
                transaction_position: end,
                flags: flags::TRANSACTION_BEGIN,
                body: RecordBody::Empty { stream_id: 9 },
            };
            let mut buf = Vec::new();
            encode_record(&record, &mut buf);
            log.append_at(end, &buf).expect("append");
            log.flush().expect("flush");
            end
        };

        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("recovery should succeed");
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(recovered.log.write_position(), first_end);
    }

    #[test]
    fn chunk_size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        drop(ChunkedLog::open(dir.path(), CHUNK).expect("open"));
        match ChunkedLog::open(dir.path(), CHUNK * 2) {
            Err(Error::InvalidHeader(msg)) => assert!(msg.contains("chunk size"), "got: {msg}"),
            Err(other) => panic!("expected InvalidHeader, got {other:?}"),
            Ok(_) => panic!("expected InvalidHeader, got Ok"),
        }
    }

    #[test]
    fn chunk_size_below_minimum_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        assert!(matches!(
            ChunkedLog::open(dir.path(), 100),
            Err(Error::InvalidArgument(_))
        ));
    }
}
