//! Per-stream consistency checks.
//!
//! For one stream of a batch, [`ConsistencyChecker::check`] compares the
//! requested precondition against the stream's current state and the event
//! IDs about to be written, and decides whether the stream accepts the write,
//! rejects it, or recognizes it as a replay of an earlier write.

use uuid::Uuid;

use crate::dedup::RecentEvents;
use crate::precommit::StreamLookup;
use crate::types::{ExpectedVersion, LogPosition, NO_STREAM};

/// Decision for one stream of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDecision {
    /// The precondition holds.
    Accept,
    /// The precondition does not hold.
    WrongVersion,
    /// These exact events were already written and replicated.
    AlreadyApplied {
        first_event_number: i64,
        last_event_number: i64,
        position: LogPosition,
    },
    /// These exact events were already written but are not replicated yet.
    AlreadyAppliedNotReady,
    /// Some, but not all, of the events match an earlier write.
    CorruptedDuplicate,
    /// The stream is tombstoned.
    Tombstoned,
}

/// Decision plus the stream state it was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCheck {
    pub decision: StreamDecision,
    /// Version reported in failures and for check-only streams.
    pub current_version: i64,
    /// Whether the stream was soft-deleted.
    pub is_soft_deleted: bool,
}

/// Outcome of lining submitted event IDs up against written events.
enum Replay {
    /// Nothing matched.
    Unmatched,
    /// Every ID matched, starting at `first`.
    Matched {
        first: i64,
        last: i64,
        position: LogPosition,
    },
    /// Every ID matched but the write is beyond the replication checkpoint.
    NotReplicated,
    /// A prefix matched.
    Partial { matched: usize },
}

/// Runs consistency checks against one snapshot of writer state.
pub struct ConsistencyChecker<'a, L> {
    lookup: &'a L,
    recent: &'a RecentEvents,
    replication_checkpoint: i64,
}

impl<'a, L: StreamLookup> ConsistencyChecker<'a, L> {
    /// # Arguments
    ///
    /// * `lookup` - Stream state, including written but unindexed transactions.
    /// * `recent` - Recently written event IDs, for replays without a version.
    /// * `replication_checkpoint` - Highest replicated log position.
    pub fn new(lookup: &'a L, recent: &'a RecentEvents, replication_checkpoint: i64) -> Self {
        Self {
            lookup,
            recent,
            replication_checkpoint,
        }
    }

    /// Check one stream of a batch.
    ///
    /// # Arguments
    ///
    /// * `stream` - Stream name.
    /// * `expected` - Requested precondition.
    /// * `event_ids` - IDs of the events routed to the stream, in order.
    /// * `is_write_target` - Whether the batch writes records to the stream.
    ///   A tombstoned stream passes `Any` and `DeletedStream` only when it is
    ///   not written.
    pub fn check(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        event_ids: &[Uuid],
        is_write_target: bool,
    ) -> StreamCheck {
        let state = self.lookup.stream_state(stream);

        let decision = if state.tombstoned {
            match expected {
                ExpectedVersion::Any | ExpectedVersion::DeletedStream if !is_write_target => {
                    StreamDecision::Accept
                }
                _ => StreamDecision::Tombstoned,
            }
        } else {
            match expected {
                ExpectedVersion::Any => {
                    self.decide(stream, self.cached_replay(stream, event_ids), || {
                        StreamDecision::Accept
                    })
                }
                ExpectedVersion::NoStream => {
                    if state.last_event_number == NO_STREAM || state.soft_deleted {
                        StreamDecision::Accept
                    } else {
                        let replay = match self.cached_replay(stream, event_ids) {
                            Replay::Unmatched => self.replay_from(stream, 0, event_ids),
                            other => other,
                        };
                        self.decide(stream, replay, || StreamDecision::WrongVersion)
                    }
                }
                ExpectedVersion::StreamExists => {
                    self.decide(stream, self.cached_replay(stream, event_ids), || {
                        if state.is_live() {
                            StreamDecision::Accept
                        } else {
                            StreamDecision::WrongVersion
                        }
                    })
                }
                ExpectedVersion::DeletedStream => StreamDecision::WrongVersion,
                ExpectedVersion::Exact(n) => {
                    let n = n as i64;
                    let replay = self.replay_from(stream, n.saturating_add(1), event_ids);
                    self.decide(stream, replay, || {
                        if state.last_event_number == n {
                            StreamDecision::Accept
                        } else {
                            StreamDecision::WrongVersion
                        }
                    })
                }
            }
        };

        StreamCheck {
            decision,
            current_version: state.current_version(),
            is_soft_deleted: state.soft_deleted,
        }
    }

    fn decide(
        &self,
        stream: &str,
        replay: Replay,
        unmatched: impl FnOnce() -> StreamDecision,
    ) -> StreamDecision {
        match replay {
            Replay::Unmatched => unmatched(),
            Replay::Matched {
                first,
                last,
                position,
            } => StreamDecision::AlreadyApplied {
                first_event_number: first,
                last_event_number: last,
                position,
            },
            Replay::NotReplicated => StreamDecision::AlreadyAppliedNotReady,
            Replay::Partial { matched } => {
                tracing::warn!(
                    stream,
                    matched,
                    "request partially matches events already in the stream"
                );
                StreamDecision::CorruptedDuplicate
            }
        }
    }

    /// Replay check starting where the cache last saw the first event ID.
    fn cached_replay(&self, stream: &str, event_ids: &[Uuid]) -> Replay {
        let Some(first) = event_ids.first() else {
            return Replay::Unmatched;
        };
        match self.recent.lookup(first) {
            Some(hit) if &*hit.stream == stream => {
                self.replay_from(stream, hit.event_number, event_ids)
            }
            _ => Replay::Unmatched,
        }
    }

    /// Compare `event_ids` with the stream's events numbered `start` onward.
    fn replay_from(&self, stream: &str, start: i64, event_ids: &[Uuid]) -> Replay {
        let mut matched = 0usize;
        let mut position = LogPosition::default();
        for (offset, id) in event_ids.iter().enumerate() {
            let written = start
                .checked_add(offset as i64)
                .and_then(|number| self.lookup.event_at(stream, number));
            match written {
                Some(event) if event.event_id == *id => {
                    matched += 1;
                    position = position.max(event.position);
                }
                _ => break,
            }
        }

        if matched == 0 {
            Replay::Unmatched
        } else if matched < event_ids.len() {
            Replay::Partial { matched }
        } else if position.commit > self.replication_checkpoint {
            Replay::NotReplicated
        } else {
            Replay::Matched {
                first: start,
                last: start + matched as i64 - 1,
                position,
            }
        }
    }
}
