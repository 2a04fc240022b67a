//! Appending assembled transactions to the tail of the log.

use crate::chunk::ChunkedLog;
use crate::codec::{self, LogRecord};
use crate::error::Error;
use crate::types::LogPosition;

/// Result of [`LogWriter::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The transaction is in the log at `position` (not yet flushed).
    Written { position: LogPosition },
    /// The transaction is larger than a whole chunk and was not written.
    TooLarge { size: u64, limit: u64 },
}

/// Writes whole transactions to a [`ChunkedLog`].
pub struct LogWriter {
    log: ChunkedLog,
    buf: Vec<u8>,
}

impl LogWriter {
    pub fn new(log: ChunkedLog) -> Self {
        Self {
            log,
            buf: Vec::new(),
        }
    }

    /// Position the next transaction will start at, if it fits the current chunk.
    pub fn write_position(&self) -> i64 {
        self.log.write_position()
    }

    /// Append the records of one transaction.
    ///
    /// A transaction never spans chunks: if it does not fit in what is left
    /// of the current chunk, the chunk is sealed and every record is placed
    /// in the next one. Positions are assigned here, in place.
    ///
    /// # Returns
    ///
    /// [`WriteOutcome::Written`] with the transaction's prepare and commit
    /// positions, or [`WriteOutcome::TooLarge`] if the records exceed the
    /// chunk size. Nothing is written in the second case.
    ///
    /// # Errors
    ///
    /// Any error means the log may hold part of the transaction and must be
    /// treated as a storage fault.
    pub fn write(&mut self, records: &mut [LogRecord]) -> Result<WriteOutcome, Error> {
        let size: u64 = records.iter().map(|r| codec::encoded_len(r) as u64).sum();
        let limit = self.log.chunk_size();
        if size > limit {
            return Ok(WriteOutcome::TooLarge { size, limit });
        }
        if size > self.log.remaining() {
            self.log.seal_and_roll()?;
        }

        let prepare = self.log.write_position();
        let mut next = prepare;
        self.buf.clear();
        for record in records.iter_mut() {
            record.log_position = next;
            record.transaction_position = prepare;
            codec::encode_record(record, &mut self.buf);
            next = prepare + self.buf.len() as i64;
        }

        let commit = self.log.append_at(prepare, &self.buf)?;
        if self.buf.capacity() > limit as usize {
            self.buf = Vec::new();
        }
        Ok(WriteOutcome::Written {
            position: LogPosition { commit, prepare },
        })
    }

    /// Make every written transaction durable.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use uuid::Uuid;

    use crate::codec::{RecordBody, flags};

    const CHUNK: u64 = 1024;

    fn records(payload_len: usize, count: usize) -> Vec<LogRecord> {
        let mut records: Vec<LogRecord> = (0..count)
            .map(|i| {
                LogRecord::unpositioned(
                    0,
                    RecordBody::Event {
                        stream_id: 0,
                        event_number: i as i64,
                        event_id: Uuid::new_v4(),
                        event_type_id: 0,
                        metadata: Bytes::new(),
                        payload: Bytes::from(vec![7u8; payload_len]),
                    },
                )
            })
            .collect();
        records[0].flags |= flags::TRANSACTION_BEGIN;
        records[count - 1].flags |= flags::TRANSACTION_END;
        records
    }

    fn writer(dir: &std::path::Path) -> LogWriter {
        LogWriter::new(ChunkedLog::open(dir, CHUNK).expect("open").log)
    }

    #[test]
    fn positions_are_assigned_contiguously() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut writer = writer(dir.path());
        let mut recs = records(10, 3);
        let outcome = writer.write(&mut recs).expect("write");

        let WriteOutcome::Written { position } = outcome else {
            panic!("expected Written, got {outcome:?}");
        };
        assert_eq!(position.prepare, 0);
        let mut expected = 0;
        for record in &recs {
            assert_eq!(record.log_position, expected);
            assert_eq!(record.transaction_position, 0);
            expected += codec::encoded_len(record) as i64;
        }
        assert_eq!(position.commit, expected);
        assert_eq!(writer.write_position(), expected);
    }

    #[test]
    fn transaction_that_does_not_fit_moves_to_next_chunk() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut writer = writer(dir.path());
        writer.write(&mut records(600, 1)).expect("first write");

        let mut second = records(300, 2);
        let outcome = writer.write(&mut second).expect("second write");
        let WriteOutcome::Written { position } = outcome else {
            panic!("expected Written, got {outcome:?}");
        };
        assert_eq!(position.prepare, CHUNK as i64);
        assert_eq!(second[0].log_position, CHUNK as i64);
        assert_eq!(second[1].transaction_position, CHUNK as i64);
        writer.flush().expect("flush");

        drop(writer);
        let recovered = ChunkedLog::open(dir.path(), CHUNK).expect("reopen");
        assert_eq!(recovered.entries.len(), 3);
    }

    #[test]
    fn transaction_larger_than_a_chunk_is_refused() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut writer = writer(dir.path());
        let outcome = writer.write(&mut records(400, 3)).expect("write");
        match outcome {
            WriteOutcome::TooLarge { size, limit } => {
                assert!(size > limit);
                assert_eq!(limit, CHUNK);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert_eq!(writer.write_position(), 0);
    }
}
