//! Combining per-stream decisions into one outcome for the batch.

use crate::consistency::{StreamCheck, StreamDecision};
use crate::response::ConsistencyCheckFailure;
use crate::types::{ExpectedVersion, LogPosition};

/// One stream's input to [`aggregate`].
#[derive(Debug, Clone, Copy)]
pub struct StreamOutcome {
    /// Precondition the request asked for.
    pub expected: ExpectedVersion,
    /// Result of the consistency check.
    pub check: StreamCheck,
    /// Whether the batch writes records to the stream.
    pub is_write_target: bool,
}

impl StreamOutcome {
    fn failure(&self, stream_index: usize) -> ConsistencyCheckFailure {
        ConsistencyCheckFailure {
            stream_index,
            expected_version: self.expected,
            actual_version: self.check.current_version,
            is_soft_deleted: self.check.is_soft_deleted,
        }
    }
}

/// Outcome for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Every stream accepts: assemble and write the transaction.
    Accept,
    /// The batch was already written; answer with the original numbers.
    Idempotent {
        first_event_numbers: Vec<i64>,
        last_event_numbers: Vec<i64>,
        position: LogPosition,
    },
    /// Reject with these failures (possibly none).
    WrongExpectedVersion(Vec<ConsistencyCheckFailure>),
    /// Reject because this stream is tombstoned.
    StreamDeleted(ConsistencyCheckFailure),
    /// Answer nothing; the client will retry once the original write is
    /// replicated.
    NoReply,
}

/// Combine the per-stream outcomes of a batch, given in stream order.
///
/// Branches, first match wins:
///
/// 1. a tombstoned stream: stream-deleted, for the first such stream;
/// 2. a corrupted duplicate: wrong version with no failure detail;
/// 3. a replay that is not replicated yet: no reply;
/// 4. a replayed stream alongside an accepted write target or a wrong
///    version: wrong version with no failure detail; replays only (check-only
///    streams that accept are neutral): idempotent success;
/// 5. a wrong version: wrong version, one failure per rejecting stream;
/// 6. otherwise: accept.
pub fn aggregate(outcomes: &[StreamOutcome]) -> BatchDecision {
    let mut tombstoned = None;
    let mut corrupted = false;
    let mut not_ready = false;
    let mut replayed = 0usize;
    let mut accepted_writes = 0usize;
    let mut wrong = Vec::new();

    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome.check.decision {
            StreamDecision::Accept => {
                if outcome.is_write_target {
                    accepted_writes += 1;
                }
            }
            StreamDecision::WrongVersion => wrong.push(outcome.failure(index)),
            StreamDecision::AlreadyApplied { .. } => replayed += 1,
            StreamDecision::AlreadyAppliedNotReady => not_ready = true,
            StreamDecision::CorruptedDuplicate => corrupted = true,
            StreamDecision::Tombstoned => {
                if tombstoned.is_none() {
                    tombstoned = Some(outcome.failure(index));
                }
            }
        }
    }

    if let Some(failure) = tombstoned {
        return BatchDecision::StreamDeleted(failure);
    }
    if corrupted {
        return BatchDecision::WrongExpectedVersion(Vec::new());
    }
    if not_ready {
        return BatchDecision::NoReply;
    }
    if replayed > 0 {
        if accepted_writes > 0 || !wrong.is_empty() {
            tracing::warn!(
                replayed,
                accepted_writes,
                wrong = wrong.len(),
                "batch mixes replayed streams with new writes"
            );
            return BatchDecision::WrongExpectedVersion(Vec::new());
        }
        return idempotent(outcomes);
    }
    if !wrong.is_empty() {
        return BatchDecision::WrongExpectedVersion(wrong);
    }
    BatchDecision::Accept
}

fn idempotent(outcomes: &[StreamOutcome]) -> BatchDecision {
    let mut first_event_numbers = Vec::with_capacity(outcomes.len());
    let mut last_event_numbers = Vec::with_capacity(outcomes.len());
    let mut position = LogPosition::default();

    for outcome in outcomes {
        let (first, last) = match outcome.check.decision {
            StreamDecision::AlreadyApplied {
                first_event_number,
                last_event_number,
                position: written,
            } => {
                position = position.max(written);
                (first_event_number, last_event_number)
            }
            _ => {
                let current = outcome.check.current_version;
                (current.saturating_add(1), current)
            }
        };
        first_event_numbers.push(first);
        last_event_numbers.push(last);
    }

    BatchDecision::Idempotent {
        first_event_numbers,
        last_event_numbers,
        position,
    }
}
