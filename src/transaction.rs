//! Turning an accepted batch into the records of one log transaction.
//!
//! A transaction is laid out as: registration records for stream and event
//! type names that have no id yet, then one data record per event. The first
//! record carries `TRANSACTION_BEGIN` and the last `TRANSACTION_END`. A batch
//! without events produces a single data-less `Empty` record.

use bytes::Bytes;
use uuid::Uuid;

use crate::codec::{LogRecord, RecordBody, encoded_len, flags};
use crate::index::StreamCommit;
use crate::metadata::StreamMetadata;
use crate::registry::{NameLookup, NameRegistry};
use crate::request::AppendBatch;
use crate::types::{
    DELETED_STREAM, IndexedEvent, LogPosition, METADATA_EVENT_TYPE, ProposedEvent,
    TOMBSTONE_EVENT_TYPE, is_metastream,
};

/// What a transaction does to one stream of its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenStream {
    /// Stream name.
    pub name: String,
    /// Whether the transaction has records for the stream.
    pub is_write_target: bool,
    /// `current + 1` before the write.
    pub first_event_number: i64,
    /// Number of the last event written, or `current` if none.
    pub last_event_number: i64,
    /// `(event_id, event_number)` of each event written.
    pub events: Vec<(Uuid, i64)>,
    /// Metadata set by the last `$metadata` event, for metadata streams.
    pub metadata: Option<StreamMetadata>,
    /// Whether the transaction tombstones the stream.
    pub tombstone: bool,
}

impl WrittenStream {
    fn new(name: &str, current_version: i64, is_write_target: bool) -> Self {
        Self {
            name: name.to_string(),
            is_write_target,
            first_event_number: current_version.saturating_add(1),
            last_event_number: current_version,
            events: Vec::new(),
            metadata: None,
            tombstone: false,
        }
    }

    fn push_event(&mut self, event: &ProposedEvent) -> i64 {
        let number = self.last_event_number + 1;
        self.last_event_number = number;
        self.events.push((event.event_id, number));
        if is_metastream(&self.name) && event.event_type == METADATA_EVENT_TYPE {
            match StreamMetadata::from_json(&event.payload) {
                Ok(metadata) => self.metadata = Some(metadata),
                Err(e) => tracing::debug!(
                    stream = %self.name,
                    error = %e,
                    "ignoring unparseable stream metadata"
                ),
            }
        }
        number
    }
}

/// Records of one transaction plus its per-stream effects.
#[derive(Debug, Clone)]
pub struct AssembledTransaction {
    /// Records in log order, positions not yet assigned.
    pub records: Vec<LogRecord>,
    /// One entry per stream of the batch, in request order.
    pub streams: Vec<WrittenStream>,
}

impl AssembledTransaction {
    /// Bytes the transaction occupies on disk.
    pub fn size(&self) -> u64 {
        self.records.iter().map(|r| encoded_len(r) as u64).sum()
    }

    /// Index effects of the transaction once written at `position`.
    pub fn commits(&self, position: LogPosition) -> Vec<StreamCommit> {
        self.streams
            .iter()
            .filter(|s| s.is_write_target)
            .map(|s| StreamCommit {
                stream: s.name.clone(),
                events: s
                    .events
                    .iter()
                    .map(|&(event_id, event_number)| IndexedEvent {
                        event_number,
                        event_id,
                        position,
                    })
                    .collect(),
                metadata: s.metadata,
                tombstone: s.tombstone,
            })
            .collect()
    }
}

/// Builds transactions, reserving ids for new names as it goes.
///
/// Reservations stay pending until the caller confirms or discards them on
/// both registries.
pub struct TransactionAssembler<'a> {
    streams: &'a mut NameRegistry,
    event_types: &'a mut NameRegistry,
}

impl<'a> TransactionAssembler<'a> {
    pub fn new(streams: &'a mut NameRegistry, event_types: &'a mut NameRegistry) -> Self {
        Self {
            streams,
            event_types,
        }
    }

    fn stream_id(&mut self, name: &str, records: &mut Vec<LogRecord>) -> u32 {
        let lookup = self.streams.get_or_reserve(name);
        if let NameLookup::Reserved(id) = lookup {
            records.push(LogRecord::unpositioned(
                0,
                RecordBody::StreamName {
                    id,
                    name: name.to_string(),
                },
            ));
        }
        lookup.id()
    }

    fn event_type_id(&mut self, name: &str, records: &mut Vec<LogRecord>) -> u32 {
        let lookup = self.event_types.get_or_reserve(name);
        if let NameLookup::Reserved(id) = lookup {
            records.push(LogRecord::unpositioned(
                0,
                RecordBody::EventType {
                    id,
                    name: name.to_string(),
                },
            ));
        }
        lookup.id()
    }

    /// Assemble an accepted batch.
    ///
    /// # Arguments
    ///
    /// * `batch` - The validated batch.
    /// * `current_versions` - Current version of each stream, in stream order.
    ///   Events are numbered from `current + 1`.
    pub fn assemble_batch(
        &mut self,
        batch: &AppendBatch,
        current_versions: &[i64],
    ) -> AssembledTransaction {
        let mut records = Vec::new();
        let mut stream_ids = Vec::with_capacity(batch.streams().len());
        let mut written = Vec::with_capacity(batch.streams().len());

        for (i, stream) in batch.streams().iter().enumerate() {
            let is_write_target = batch.is_write_target(i);
            if is_write_target {
                stream_ids.push(Some(self.stream_id(&stream.name, &mut records)));
            } else {
                stream_ids.push(None);
            }
            written.push(WrittenStream::new(&stream.name, current_versions[i], is_write_target));
        }

        let mut data = Vec::with_capacity(batch.events().len().max(1));
        for (e, event) in batch.events().iter().enumerate() {
            let s = batch.stream_of_event(e);
            let stream_id = match stream_ids[s] {
                Some(id) => id,
                None => self.stream_id(&written[s].name, &mut records),
            };
            let event_type_id = self.event_type_id(&event.event_type, &mut records);
            let event_number = written[s].push_event(event);
            data.push(LogRecord::unpositioned(
                if event.is_json { flags::IS_JSON } else { 0 },
                RecordBody::Event {
                    stream_id,
                    event_number,
                    event_id: event.event_id,
                    event_type_id,
                    metadata: event.metadata.clone(),
                    payload: event.payload.clone(),
                },
            ));
        }

        if batch.events().is_empty() {
            let stream_id = match stream_ids.first().copied().flatten() {
                Some(id) => id,
                None => self.stream_id(&written[0].name, &mut records),
            };
            data.push(LogRecord::unpositioned(0, RecordBody::Empty { stream_id }));
        }

        records.extend(data);
        mark_boundaries(&mut records);
        AssembledTransaction {
            records,
            streams: written,
        }
    }

    /// Assemble the tombstone of `stream`.
    pub fn assemble_tombstone(
        &mut self,
        stream: &str,
        current_version: i64,
    ) -> AssembledTransaction {
        let mut records = Vec::new();
        let stream_id = self.stream_id(stream, &mut records);
        let event_type_id = self.event_type_id(TOMBSTONE_EVENT_TYPE, &mut records);
        records.push(LogRecord::unpositioned(
            flags::STREAM_DELETE,
            RecordBody::Event {
                stream_id,
                event_number: DELETED_STREAM,
                event_id: Uuid::new_v4(),
                event_type_id,
                metadata: Bytes::new(),
                payload: Bytes::new(),
            },
        ));
        mark_boundaries(&mut records);

        let mut written = WrittenStream::new(stream, current_version, true);
        written.first_event_number = DELETED_STREAM;
        written.last_event_number = DELETED_STREAM;
        written.tombstone = true;
        AssembledTransaction {
            records,
            streams: vec![written],
        }
    }

    /// Assemble a single `$metadata` event written to `metastream`.
    pub fn assemble_metadata(
        &mut self,
        metastream: &str,
        current_version: i64,
        metadata: StreamMetadata,
    ) -> AssembledTransaction {
        let event = ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: METADATA_EVENT_TYPE.to_string(),
            is_json: true,
            metadata: Bytes::new(),
            payload: metadata.to_json(),
        };

        let mut records = Vec::new();
        let stream_id = self.stream_id(metastream, &mut records);
        let event_type_id = self.event_type_id(METADATA_EVENT_TYPE, &mut records);
        let mut written = WrittenStream::new(metastream, current_version, true);
        let event_number = written.push_event(&event);
        records.push(LogRecord::unpositioned(
            flags::IS_JSON,
            RecordBody::Event {
                stream_id,
                event_number,
                event_id: event.event_id,
                event_type_id,
                metadata: event.metadata,
                payload: event.payload,
            },
        ));
        mark_boundaries(&mut records);
        AssembledTransaction {
            records,
            streams: vec![written],
        }
    }
}

fn mark_boundaries(records: &mut [LogRecord]) {
    if let Some(first) = records.first_mut() {
        first.flags |= flags::TRANSACTION_BEGIN;
    }
    if let Some(last) = records.last_mut() {
        last.flags |= flags::TRANSACTION_END;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::request::AppendRequest;
    use crate::types::NO_STREAM;

    fn event(event_type: &str) -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            is_json: true,
            metadata: Bytes::new(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn batch(names: &[&str], events: Vec<ProposedEvent>, indexes: &[i32]) -> AppendBatch {
        AppendRequest {
            stream_names: names.iter().map(|s| s.to_string()).collect(),
            expected_versions: vec![-2; names.len()],
            events,
            event_stream_indexes: indexes.to_vec(),
        }
        .validate()
        .expect("valid batch")
    }

    fn event_numbers(records: &[LogRecord]) -> Vec<(u32, i64)> {
        records
            .iter()
            .filter_map(|r| match &r.body {
                RecordBody::Event {
                    stream_id,
                    event_number,
                    ..
                } => Some((*stream_id, *event_number)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn interleaved_batch_numbers_each_stream_independently() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let b = batch(&["a", "b"], vec![event("X"), event("Y"), event("X")], &[0, 1, 0]);
        let txn = TransactionAssembler::new(&mut streams, &mut types)
            .assemble_batch(&b, &[NO_STREAM, NO_STREAM]);

        // Two stream registrations, two type registrations, three events.
        assert_eq!(txn.records.len(), 7);
        assert!(matches!(txn.records[0].body, RecordBody::StreamName { id: 0, .. }));
        assert!(matches!(txn.records[1].body, RecordBody::StreamName { id: 1, .. }));
        assert_eq!(event_numbers(&txn.records), vec![(0, 0), (1, 0), (0, 1)]);

        assert_eq!(txn.streams[0].first_event_number, 0);
        assert_eq!(txn.streams[0].last_event_number, 1);
        assert_eq!(txn.streams[1].first_event_number, 0);
        assert_eq!(txn.streams[1].last_event_number, 0);
    }

    #[test]
    fn only_first_and_last_records_carry_boundaries() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let b = batch(&["a"], vec![event("X"), event("X")], &[]);
        let txn =
            TransactionAssembler::new(&mut streams, &mut types).assemble_batch(&b, &[NO_STREAM]);

        let n = txn.records.len();
        assert!(txn.records[0].has_flag(flags::TRANSACTION_BEGIN));
        assert!(txn.records[n - 1].has_flag(flags::TRANSACTION_END));
        for record in &txn.records[1..n - 1] {
            assert!(!record.has_flag(flags::TRANSACTION_BEGIN));
            assert!(!record.has_flag(flags::TRANSACTION_END));
        }
        assert!(txn.records[n - 1].has_flag(flags::IS_JSON));
    }

    #[test]
    fn known_names_are_not_registered_again() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        streams.get_or_reserve("a");
        types.get_or_reserve("X");
        streams.confirm_reservations();
        types.confirm_reservations();

        let b = batch(&["a"], vec![event("X")], &[]);
        let txn = TransactionAssembler::new(&mut streams, &mut types).assemble_batch(&b, &[4]);
        assert_eq!(txn.records.len(), 1);
        assert_eq!(event_numbers(&txn.records), vec![(0, 5)]);
        assert_eq!(txn.streams[0].first_event_number, 5);
    }

    #[test]
    fn empty_write_emits_one_marker_record() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        streams.get_or_reserve("a");
        streams.confirm_reservations();

        let b = batch(&["a"], vec![], &[]);
        let txn = TransactionAssembler::new(&mut streams, &mut types).assemble_batch(&b, &[2]);
        assert_eq!(txn.records.len(), 1);
        assert_eq!(txn.records[0].body, RecordBody::Empty { stream_id: 0 });
        assert!(txn.records[0].has_flag(flags::TRANSACTION_BEGIN | flags::TRANSACTION_END));
        assert_eq!(txn.streams[0].first_event_number, 3);
        assert_eq!(txn.streams[0].last_event_number, 2);
        assert_eq!(txn.commits(LogPosition::default()).len(), 1);
    }

    #[test]
    fn check_only_streams_get_no_records_or_commits() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let b = batch(&["a", "b"], vec![event("X")], &[0]);
        let txn = TransactionAssembler::new(&mut streams, &mut types)
            .assemble_batch(&b, &[NO_STREAM, 7]);

        assert_eq!(streams.lookup("b"), None);
        assert_eq!(txn.streams[1].first_event_number, 8);
        assert_eq!(txn.streams[1].last_event_number, 7);
        let commits = txn.commits(LogPosition::default());
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].stream, "a");
    }

    #[test]
    fn metadata_events_on_metastreams_are_parsed() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let mut meta = event(METADATA_EVENT_TYPE);
        meta.payload = StreamMetadata::soft_deleted().to_json();
        let b = batch(&["$$a"], vec![meta], &[]);
        let txn =
            TransactionAssembler::new(&mut streams, &mut types).assemble_batch(&b, &[NO_STREAM]);
        assert_eq!(txn.streams[0].metadata, Some(StreamMetadata::soft_deleted()));
    }

    #[test]
    fn tombstone_is_a_flagged_event_at_deleted_stream() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let txn = TransactionAssembler::new(&mut streams, &mut types).assemble_tombstone("a", 3);
        let last = txn.records.last().expect("records");
        assert!(last.has_flag(flags::STREAM_DELETE));
        assert_eq!(event_numbers(&txn.records), vec![(0, DELETED_STREAM)]);

        let commits = txn.commits(LogPosition::default());
        assert!(commits[0].tombstone);
        assert!(commits[0].events.is_empty());
    }

    #[test]
    fn metadata_transaction_continues_the_metastream() {
        let (mut streams, mut types) = (NameRegistry::new(), NameRegistry::new());
        let txn = TransactionAssembler::new(&mut streams, &mut types).assemble_metadata(
            "$$a",
            1,
            StreamMetadata::truncated_before(4),
        );
        assert_eq!(event_numbers(&txn.records), vec![(0, 2)]);
        assert_eq!(txn.streams[0].metadata, Some(StreamMetadata::truncated_before(4)));
        assert!(txn.size() > 0);
    }
}
