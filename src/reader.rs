//! Read-only handle to the committed lookup index.
//!
//! `ReadIndex` answers questions about stream state without going through the
//! writer task. It only sees what the index committer has applied, so a write
//! is invisible here until it is replicated.

use crate::index::StreamIndex;
use crate::types::{IndexedEvent, StreamInfo, StreamState};

/// Shared, read-only handle to the lookup index.
///
/// Cloning produces a new handle to the same data.
#[derive(Clone, Debug)]
pub struct ReadIndex {
    index: StreamIndex,
}

impl ReadIndex {
    /// Create a handle over `index`.
    pub fn new(index: StreamIndex) -> ReadIndex {
        ReadIndex { index }
    }

    /// Current version of `stream`.
    ///
    /// # Returns
    ///
    /// The last event number, `NO_STREAM` (-1) if the stream has no events,
    /// or `DELETED_STREAM` if it is tombstoned.
    pub fn stream_version(&self, stream: &str) -> i64 {
        self.index.stream_state(stream).current_version()
    }

    /// Full committed state of `stream`, including deletion flags.
    pub fn stream_state(&self, stream: &str) -> StreamState {
        self.index.stream_state(stream)
    }

    /// Identity and location of event `event_number` of `stream`.
    pub fn event_at(&self, stream: &str, event_number: i64) -> Option<IndexedEvent> {
        self.index.event_at(stream, event_number)
    }

    /// Every stream with committed state, sorted by name.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.index.list_streams()
    }

    /// Commit position of the last indexed transaction.
    pub fn indexed_position(&self) -> i64 {
        self.index.indexed_position()
    }
}
