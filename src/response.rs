//! Outcomes of append and delete requests.
//!
//! Every outcome here is ordinary data, including the failures: a wrong
//! expected version or a deleted stream is a normal answer, not an error.

use crate::types::{ExpectedVersion, LogPosition};

/// Why one stream's precondition did not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyCheckFailure {
    /// Index of the stream in the request's stream list.
    pub stream_index: usize,
    /// Precondition the request asked for.
    pub expected_version: ExpectedVersion,
    /// Current version of the stream: the last event number, `NO_STREAM` if
    /// absent, `DELETED_STREAM` if tombstoned.
    pub actual_version: i64,
    /// Whether the stream was soft-deleted when it was checked.
    pub is_soft_deleted: bool,
}

/// Result of an append or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResponse {
    /// The batch is in the log and indexed (or was already, for a replay).
    ///
    /// The arrays follow the request's stream order. A stream that received
    /// nothing reports `first = current + 1` and `last = current`.
    Success {
        first_event_numbers: Vec<i64>,
        last_event_numbers: Vec<i64>,
        position: LogPosition,
    },
    /// At least one precondition failed. Empty when the batch was a partial
    /// or mixed replay of an earlier write.
    WrongExpectedVersion {
        failures: Vec<ConsistencyCheckFailure>,
    },
    /// A written stream is tombstoned.
    StreamDeleted { failure: ConsistencyCheckFailure },
    /// The batch does not fit in one chunk.
    InvalidTransaction,
    /// Rejected by authorization. Never produced by the write path itself.
    AccessDenied,
    /// Replication did not complete in time. Never produced by the write path
    /// itself.
    Timeout,
}

/// The single-stream shape of [`AppendResponse`] used by older callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleStreamResponse {
    Success {
        first_event_number: i64,
        last_event_number: i64,
        position: LogPosition,
    },
    WrongExpectedVersion {
        /// Current version of the stream, when known.
        current_version: Option<i64>,
    },
    StreamDeleted,
    InvalidTransaction,
    AccessDenied,
    Timeout,
}

impl AppendResponse {
    /// Whether this is a [`AppendResponse::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, AppendResponse::Success { .. })
    }

    /// Convert to the single-stream shape.
    ///
    /// Returns `None` when the response describes more than one stream.
    pub fn into_single_stream(self) -> Option<SingleStreamResponse> {
        let single = match self {
            AppendResponse::Success {
                first_event_numbers,
                last_event_numbers,
                position,
            } => match (first_event_numbers.as_slice(), last_event_numbers.as_slice()) {
                ([first], [last]) => SingleStreamResponse::Success {
                    first_event_number: *first,
                    last_event_number: *last,
                    position,
                },
                _ => return None,
            },
            AppendResponse::WrongExpectedVersion { failures } => match failures.as_slice() {
                [] => SingleStreamResponse::WrongExpectedVersion {
                    current_version: None,
                },
                [failure] if failure.stream_index == 0 => {
                    SingleStreamResponse::WrongExpectedVersion {
                        current_version: Some(failure.actual_version),
                    }
                }
                _ => return None,
            },
            AppendResponse::StreamDeleted { failure } => {
                if failure.stream_index != 0 {
                    return None;
                }
                SingleStreamResponse::StreamDeleted
            }
            AppendResponse::InvalidTransaction => SingleStreamResponse::InvalidTransaction,
            AppendResponse::AccessDenied => SingleStreamResponse::AccessDenied,
            AppendResponse::Timeout => SingleStreamResponse::Timeout,
        };
        Some(single)
    }
}
