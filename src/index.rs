//! In-memory lookup index of committed stream state.
//!
//! The index maps stream names to the identities and locations of their
//! events, their tombstone flag and their truncation marker. It only ever
//! reflects transactions that the index committer has applied, which happens
//! after replication. A whole transaction is applied under one write lock, so
//! readers see either all of its streams advance or none.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::metadata::StreamMetadata;
use crate::types::{
    DELETED_STREAM, IndexedEvent, LogPosition, NO_STREAM, StreamInfo, StreamState,
    original_stream_of,
};

/// The effect of one transaction on one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCommit {
    /// Stream written by the transaction.
    pub stream: String,
    /// Events appended to the stream, in event number order.
    pub events: Vec<IndexedEvent>,
    /// New metadata, when `stream` is a metadata stream and the transaction
    /// wrote a `$metadata` event to it.
    pub metadata: Option<StreamMetadata>,
    /// Whether the transaction tombstoned the stream.
    pub tombstone: bool,
}

impl StreamCommit {
    /// A commit that only appends `events`.
    pub fn events(stream: impl Into<String>, events: Vec<IndexedEvent>) -> Self {
        Self {
            stream: stream.into(),
            events,
            metadata: None,
            tombstone: false,
        }
    }
}

/// Indexed state of one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamEntry {
    /// Events in event number order; the vector index is the event number.
    events: Vec<IndexedEvent>,
    tombstoned: bool,
    truncate_before: Option<i64>,
}

impl StreamEntry {
    /// Number of the last indexed event, or [`NO_STREAM`].
    pub fn last_event_number(&self) -> i64 {
        self.events.len() as i64 - 1
    }

    /// Observable state of the stream.
    pub fn state(&self) -> StreamState {
        StreamState {
            last_event_number: self.last_event_number(),
            tombstoned: self.tombstoned,
            soft_deleted: self.truncate_before == Some(DELETED_STREAM),
        }
    }

    /// Event numbered `event_number`, if indexed.
    pub fn event_at(&self, event_number: i64) -> Option<IndexedEvent> {
        usize::try_from(event_number)
            .ok()
            .and_then(|n| self.events.get(n).copied())
    }

    /// Current truncation marker.
    pub fn truncate_before(&self) -> Option<i64> {
        self.truncate_before
    }
}

/// Contents guarded by the index lock.
#[derive(Debug, Default)]
pub struct IndexState {
    streams: HashMap<String, StreamEntry>,
    /// Commit position of the last applied transaction.
    indexed_position: i64,
}

impl IndexState {
    /// Entry of `stream`, if it was ever written or given metadata.
    pub fn entry(&self, stream: &str) -> Option<&StreamEntry> {
        self.streams.get(stream)
    }

    /// Committed state of `stream`.
    pub fn stream_state(&self, stream: &str) -> StreamState {
        self.entry(stream)
            .map_or(StreamState::ABSENT, StreamEntry::state)
    }

    /// Commit position of the last applied transaction.
    pub fn indexed_position(&self) -> i64 {
        self.indexed_position
    }

    fn check(&self, commit: &StreamCommit) -> Result<(), Error> {
        let divergence = |detail: String| Error::IndexDivergence {
            stream: commit.stream.clone(),
            detail,
        };
        let entry = self.entry(&commit.stream);
        if entry.is_some_and(|e| e.tombstoned) && (commit.tombstone || !commit.events.is_empty()) {
            return Err(divergence("stream is already tombstoned".to_string()));
        }
        let mut expected = entry.map_or(NO_STREAM, StreamEntry::last_event_number) + 1;
        for event in &commit.events {
            if event.event_number != expected {
                return Err(divergence(format!(
                    "event {} ({}) arrived where event {expected} was expected",
                    event.event_number, event.event_id
                )));
            }
            expected += 1;
        }
        if commit.metadata.is_some() && original_stream_of(&commit.stream).is_none() {
            return Err(divergence("metadata written to a non-metadata stream".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, commit: &StreamCommit) {
        if !commit.events.is_empty() || commit.tombstone {
            let entry = self.streams.entry(commit.stream.clone()).or_default();
            entry.events.extend_from_slice(&commit.events);
            entry.tombstoned |= commit.tombstone;
        }
        if let (Some(metadata), Some(original)) =
            (commit.metadata, original_stream_of(&commit.stream))
        {
            let entry = self.streams.entry(original.to_string()).or_default();
            entry.truncate_before = metadata.truncate_before;
        }
    }
}

/// Shared handle to the lookup index.
///
/// Cloning produces a new handle to the same data. The index committer is the
/// only writer; the log writer and [`ReadIndex`](crate::reader::ReadIndex)
/// handles only read.
#[derive(Clone, Debug, Default)]
pub struct StreamIndex {
    state: Arc<RwLock<IndexState>>,
}

impl StreamIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a consistent snapshot of the index.
    pub fn with_state<R>(&self, f: impl FnOnce(&IndexState) -> R) -> R {
        let state = self.state.read().expect("StreamIndex RwLock poisoned");
        f(&state)
    }

    /// Committed state of `stream`.
    pub fn stream_state(&self, stream: &str) -> StreamState {
        self.with_state(|state| state.stream_state(stream))
    }

    /// Committed event `event_number` of `stream`.
    pub fn event_at(&self, stream: &str, event_number: i64) -> Option<IndexedEvent> {
        self.with_state(|state| state.entry(stream)?.event_at(event_number))
    }

    /// Commit position of the last applied transaction.
    pub fn indexed_position(&self) -> i64 {
        self.with_state(IndexState::indexed_position)
    }

    /// Every stream with indexed state, sorted by name.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.with_state(|state| {
            let mut streams: Vec<StreamInfo> = state
                .streams
                .iter()
                .map(|(name, entry)| StreamInfo {
                    stream: name.clone(),
                    state: entry.state(),
                })
                .collect();
            streams.sort_by(|a, b| a.stream.cmp(&b.stream));
            streams
        })
    }

    /// Apply one transaction's effects to the index.
    ///
    /// Either every commit is applied or none is: all of them are checked
    /// before the index changes.
    ///
    /// # Arguments
    ///
    /// * `commits` - Effects of the transaction, one per written stream.
    /// * `position` - Location of the transaction in the log.
    ///
    /// # Errors
    ///
    /// - [`Error::PositionMismatch`] if `position` precedes an already
    ///   indexed transaction.
    /// - [`Error::IndexDivergence`] if an event number does not continue the
    ///   stream, a tombstoned stream would change, or metadata targets a
    ///   non-metadata stream.
    pub fn apply_transaction(
        &self,
        commits: &[StreamCommit],
        position: LogPosition,
    ) -> Result<(), Error> {
        let mut state = self.state.write().expect("StreamIndex RwLock poisoned");
        if position.prepare < state.indexed_position {
            return Err(Error::PositionMismatch {
                expected: state.indexed_position,
                actual: position.prepare,
            });
        }
        for commit in commits {
            state.check(commit)?;
        }
        for commit in commits {
            state.apply(commit);
        }
        state.indexed_position = position.commit;
        Ok(())
    }
}
