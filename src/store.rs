//! Opening a store: configuration and recovery.
//!
//! [`Store::open`] scans the chunked log, truncates anything a crash left
//! half-written, and rebuilds every piece of in-memory state from the surviving
//! records: the stream and event type registries, the lookup index, and the
//! cache of recent event IDs. The resulting [`Store`] is handed to
//! [`spawn_writer`](crate::writer::spawn_writer), which starts the pipeline.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkedLog, LogEntry};
use crate::codec::{RecordBody, flags};
use crate::dedup::RecentEvents;
use crate::error::Error;
use crate::index::{StreamCommit, StreamIndex};
use crate::log_writer::LogWriter;
use crate::metadata::StreamMetadata;
use crate::registry::NameRegistry;
use crate::types::{IndexedEvent, LogPosition, METADATA_EVENT_TYPE, is_metastream};

/// Default data capacity of one chunk file.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Default number of commands queued for the writer before callers wait.
pub const DEFAULT_WRITER_QUEUE: usize = 64;

/// Default number of event IDs remembered for replay detection.
pub const DEFAULT_DEDUP_CAPACITY: NonZeroUsize = match NonZeroUsize::new(65536) {
    Some(n) => n,
    None => unreachable!(),
};

/// Default capacity of the completion broadcast channel.
pub const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Settings for opening a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding the chunk files.
    pub data_dir: PathBuf,
    /// Data capacity of each chunk, which is also the largest transaction
    /// the store accepts.
    pub chunk_size: u64,
    /// Bound of the writer command channel.
    pub writer_queue: usize,
    /// Event IDs remembered for replay detection.
    pub dedup_capacity: NonZeroUsize,
    /// Completions buffered per subscriber.
    pub broker_capacity: usize,
}

impl StoreConfig {
    /// Defaults for everything but the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            writer_queue: DEFAULT_WRITER_QUEUE,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            broker_capacity: DEFAULT_BROKER_CAPACITY,
        }
    }
}

/// A recovered store, ready to be spawned.
pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) log: LogWriter,
    pub(crate) streams: NameRegistry,
    pub(crate) event_types: NameRegistry,
    pub(crate) index: StreamIndex,
    pub(crate) recent: RecentEvents,
    /// Transactions beyond the replication checkpoint, oldest first.
    pub(crate) unindexed: Vec<(LogPosition, Vec<StreamCommit>)>,
}

impl Store {
    /// Open or create the store described by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Store settings.
    /// * `replicated` - Replication checkpoint at startup. Recovered
    ///   transactions at or below it are indexed right away; the rest wait in
    ///   the index committer.
    ///
    /// # Errors
    ///
    /// - Every error of [`ChunkedLog::open`].
    /// - [`Error::CorruptRecord`] if a record names a stream or event type
    ///   that was never registered, or registrations are out of order.
    /// - [`Error::IndexDivergence`] if the recovered events do not form
    ///   contiguous streams.
    pub fn open(config: StoreConfig, replicated: i64) -> Result<Store, Error> {
        let recovered = ChunkedLog::open(&config.data_dir, config.chunk_size)?;
        let mut streams = NameRegistry::new();
        let mut event_types = NameRegistry::new();
        let index = StreamIndex::new();
        let mut recent = RecentEvents::new(config.dedup_capacity);
        let mut unindexed = Vec::new();

        for entries in recovered
            .entries
            .chunk_by(|a, b| a.record.transaction_position == b.record.transaction_position)
        {
            let (position, commits) = replay_transaction(entries, &mut streams, &mut event_types)?;
            for commit in &commits {
                recent.record(
                    &commit.stream,
                    commit.events.iter().map(|e| (e.event_id, e.event_number)),
                );
            }
            if position.commit <= replicated {
                index.apply_transaction(&commits, position)?;
            } else {
                unindexed.push((position, commits));
            }
        }

        let log = LogWriter::new(recovered.log);
        tracing::info!(
            dir = %config.data_dir.display(),
            write_position = log.write_position(),
            streams = streams.len(),
            indexed = index.indexed_position(),
            unindexed = unindexed.len(),
            "store opened"
        );

        Ok(Store {
            config,
            log,
            streams,
            event_types,
            index,
            recent,
            unindexed,
        })
    }

    /// Settings the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Data directory of the store.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Position the next transaction will be written at.
    pub fn write_position(&self) -> i64 {
        self.log.write_position()
    }

    /// Index rebuilt from the log.
    pub fn index(&self) -> &StreamIndex {
        &self.index
    }

    /// Number of recovered transactions still waiting for replication.
    pub fn unindexed_len(&self) -> usize {
        self.unindexed.len()
    }
}

/// Rebuild one transaction's registrations and index effects from its
/// records.
fn replay_transaction(
    entries: &[LogEntry],
    streams: &mut NameRegistry,
    event_types: &mut NameRegistry,
) -> Result<(LogPosition, Vec<StreamCommit>), Error> {
    let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
        return Ok((LogPosition::default(), Vec::new()));
    };
    let position = LogPosition {
        commit: last.next_position,
        prepare: first.record.transaction_position,
    };

    let mut commits: Vec<StreamCommit> = Vec::new();
    for entry in entries {
        let record = &entry.record;
        let at = record.log_position;
        match &record.body {
            RecordBody::StreamName { id, name } => streams.register(*id, name, at)?,
            RecordBody::EventType { id, name } => event_types.register(*id, name, at)?,
            RecordBody::Empty { stream_id } => {
                let stream = stream_name(streams, *stream_id, at)?;
                commit_for(&mut commits, stream);
            }
            RecordBody::Event {
                stream_id,
                event_number,
                event_id,
                event_type_id,
                payload,
                ..
            } => {
                let stream = stream_name(streams, *stream_id, at)?;
                let event_type = event_types.name_of(*event_type_id).ok_or_else(|| {
                    Error::CorruptRecord {
                        position: at,
                        detail: format!("unknown event type id {event_type_id}"),
                    }
                })?;
                let commit = commit_for(&mut commits, stream);
                if record.has_flag(flags::STREAM_DELETE) {
                    commit.tombstone = true;
                    continue;
                }
                commit.events.push(IndexedEvent {
                    event_number: *event_number,
                    event_id: *event_id,
                    position,
                });
                if is_metastream(stream) && event_type == METADATA_EVENT_TYPE {
                    match StreamMetadata::from_json(payload) {
                        Ok(metadata) => commit.metadata = Some(metadata),
                        Err(e) => tracing::debug!(
                            stream,
                            position = at,
                            error = %e,
                            "ignoring unparseable stream metadata"
                        ),
                    }
                }
            }
        }
    }
    Ok((position, commits))
}

fn stream_name(streams: &NameRegistry, id: u32, position: i64) -> Result<&str, Error> {
    streams.name_of(id).ok_or_else(|| Error::CorruptRecord {
        position,
        detail: format!("unknown stream id {id}"),
    })
}

fn commit_for<'a>(commits: &'a mut Vec<StreamCommit>, stream: &str) -> &'a mut StreamCommit {
    let index = match commits.iter().position(|c| c.stream == stream) {
        Some(index) => index,
        None => {
            commits.push(StreamCommit::events(stream, Vec::new()));
            commits.len() - 1
        }
    };
    &mut commits[index]
}
