//! The log writer's view of stream state.
//!
//! The lookup index only reflects replicated transactions, but the writer has
//! to number new events after everything already in the log. The
//! [`PreCommitCache`] holds the effects of transactions that are written but
//! not yet indexed, and [`WriterView`] overlays them on the index.

use std::collections::VecDeque;

use crate::index::{IndexState, StreamCommit, StreamIndex};
use crate::types::{DELETED_STREAM, IndexedEvent, LogPosition, StreamState, metastream_of};

/// Read access to stream state, as needed by the consistency checker.
pub trait StreamLookup {
    /// Current state of `stream`.
    fn stream_state(&self, stream: &str) -> StreamState;

    /// Identity of event `event_number` of `stream`, if it exists.
    fn event_at(&self, stream: &str, event_number: i64) -> Option<IndexedEvent>;
}

impl StreamLookup for StreamIndex {
    fn stream_state(&self, stream: &str) -> StreamState {
        StreamIndex::stream_state(self, stream)
    }

    fn event_at(&self, stream: &str, event_number: i64) -> Option<IndexedEvent> {
        StreamIndex::event_at(self, stream, event_number)
    }
}

/// Transactions written to the log and not yet applied to the index, oldest
/// first. Owned by the writer task.
#[derive(Debug, Default)]
pub struct PreCommitCache {
    transactions: VecDeque<(LogPosition, Vec<StreamCommit>)>,
}

impl PreCommitCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a written transaction.
    pub fn push(&mut self, position: LogPosition, commits: Vec<StreamCommit>) {
        self.transactions.push_back((position, commits));
    }

    /// Forget transactions the index has caught up with.
    pub fn prune(&mut self, indexed_position: i64) {
        while self
            .transactions
            .front()
            .is_some_and(|(position, _)| position.commit <= indexed_position)
        {
            self.transactions.pop_front();
        }
    }

    /// Number of transactions held.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether no transaction is held.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Commits of transactions beyond `indexed_position`, oldest first.
    fn unindexed(&self, indexed_position: i64) -> impl Iterator<Item = &StreamCommit> {
        self.transactions
            .iter()
            .filter(move |(position, _)| position.commit > indexed_position)
            .flat_map(|(_, commits)| commits.iter())
    }
}

/// Index plus pre-committed transactions, read under one index lock.
///
/// Reading the index state and its indexed position together means a
/// transaction is counted exactly once even while the committer applies it.
pub struct WriterView<'a> {
    index: &'a StreamIndex,
    pending: &'a PreCommitCache,
}

impl<'a> WriterView<'a> {
    /// Overlay `pending` on `index`.
    pub fn new(index: &'a StreamIndex, pending: &'a PreCommitCache) -> Self {
        Self { index, pending }
    }

    fn overlay_state(&self, state: &IndexState, stream: &str) -> StreamState {
        let base = state.entry(stream);
        let mut last_event_number = state.stream_state(stream).last_event_number;
        let mut tombstoned = base.is_some_and(|e| e.state().tombstoned);
        let mut truncate_before = base.and_then(|e| e.truncate_before());
        let metastream = metastream_of(stream);

        for commit in self.pending.unindexed(state.indexed_position()) {
            if commit.stream == stream {
                if let Some(last) = commit.events.last() {
                    last_event_number = last.event_number;
                }
                tombstoned |= commit.tombstone;
            }
            if commit.stream == metastream {
                if let Some(metadata) = commit.metadata {
                    truncate_before = metadata.truncate_before;
                }
            }
        }

        StreamState {
            last_event_number,
            tombstoned,
            soft_deleted: truncate_before == Some(DELETED_STREAM),
        }
    }
}

impl StreamLookup for WriterView<'_> {
    fn stream_state(&self, stream: &str) -> StreamState {
        self.index
            .with_state(|state| self.overlay_state(state, stream))
    }

    fn event_at(&self, stream: &str, event_number: i64) -> Option<IndexedEvent> {
        self.index.with_state(|state| {
            let pending = self
                .pending
                .unindexed(state.indexed_position())
                .filter(|c| c.stream == stream)
                .flat_map(|c| c.events.iter())
                .find(|e| e.event_number == event_number)
                .copied();
            pending.or_else(|| state.entry(stream)?.event_at(event_number))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use crate::metadata::StreamMetadata;

    fn pos(prepare: i64, commit: i64) -> LogPosition {
        LogPosition { commit, prepare }
    }

    fn commit(stream: &str, from: i64, count: i64, position: LogPosition) -> StreamCommit {
        StreamCommit::events(
            stream,
            (from..from + count)
                .map(|event_number| IndexedEvent {
                    event_number,
                    event_id: Uuid::new_v4(),
                    position,
                })
                .collect(),
        )
    }

    #[test]
    fn view_sees_pending_events_beyond_the_index() {
        let index = StreamIndex::new();
        let p1 = pos(0, 50);
        index
            .apply_transaction(&[commit("a", 0, 2, p1)], p1)
            .expect("apply");

        let mut pending = PreCommitCache::new();
        pending.push(p1, vec![commit("a", 0, 2, p1)]);
        let p2 = pos(50, 90);
        let c2 = commit("a", 2, 3, p2);
        let third = c2.events[0];
        pending.push(p2, vec![c2]);

        let view = WriterView::new(&index, &pending);
        assert_eq!(view.stream_state("a").last_event_number, 4);
        assert_eq!(view.event_at("a", 2), Some(third));
        assert!(view.event_at("a", 0).is_some());
        assert_eq!(view.event_at("a", 5), None);
    }

    #[test]
    fn already_indexed_pending_transactions_are_not_counted_twice() {
        let index = StreamIndex::new();
        let p1 = pos(0, 50);
        let c1 = commit("a", 0, 2, p1);
        let mut pending = PreCommitCache::new();
        pending.push(p1, vec![c1.clone()]);
        index.apply_transaction(&[c1], p1).expect("apply");

        let view = WriterView::new(&index, &pending);
        assert_eq!(view.stream_state("a").last_event_number, 1);

        pending.prune(index.indexed_position());
        assert!(pending.is_empty());
    }

    #[test]
    fn pending_metadata_soft_deletes_and_tombstones_show() {
        let index = StreamIndex::new();
        let mut pending = PreCommitCache::new();
        let p1 = pos(0, 40);
        pending.push(p1, vec![commit("a", 0, 1, p1)]);
        let p2 = pos(40, 80);
        let mut meta = commit("$$a", 0, 1, p2);
        meta.metadata = Some(StreamMetadata::soft_deleted());
        pending.push(p2, vec![meta]);
        let p3 = pos(80, 120);
        pending.push(
            p3,
            vec![StreamCommit {
                stream: "b".into(),
                events: vec![],
                metadata: None,
                tombstone: true,
            }],
        );

        let view = WriterView::new(&index, &pending);
        let a = view.stream_state("a");
        assert!(a.soft_deleted);
        assert_eq!(a.last_event_number, 0);
        assert!(view.stream_state("b").tombstoned);
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn prune_keeps_unindexed_transactions() {
        let mut pending = PreCommitCache::new();
        pending.push(pos(0, 10), vec![]);
        pending.push(pos(10, 20), vec![]);
        pending.prune(10);
        assert_eq!(pending.len(), 1);
    }
}
