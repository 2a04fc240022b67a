//! Error types for StrandDB.
//!
//! Two kinds of failure live here. [`Error`] covers everything a caller can
//! observe and recover from: malformed requests, I/O while opening the store,
//! corrupt files found during recovery. [`StorageFault`] is the unrecoverable
//! tier: once the log writer or the index committer has started mutating
//! durable state, any failure is wrapped in a `StorageFault` and ends the task
//! that hit it. The hosting process must stop the whole service when it sees
//! one.
//!
//! Consistency failures (wrong expected version, deleted stream, oversized
//! transaction) are not errors at all. They are ordinary
//! [`AppendResponse`](crate::response::AppendResponse) values.

/// Unified error type for StrandDB operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request is structurally invalid. Raised before any storage access.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single event exceeds the maximum allowed size.
    #[error("event too large: {size} bytes exceeds {max} byte limit")]
    EventTooLarge {
        /// Size of the event (type + metadata + payload) in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk is corrupt (CRC mismatch, malformed field, bad position).
    #[error("corrupt record at log position {position}: {detail}")]
    CorruptRecord {
        /// Log position of the corrupt record, or of the chunk start when unknown.
        position: i64,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// A chunk file header is invalid or does not match the configuration.
    #[error("invalid chunk header: {0}")]
    InvalidHeader(String),

    /// The log was asked to append at a position other than its write position.
    #[error("log position mismatch: expected {expected}, got {actual}")]
    PositionMismatch {
        /// Current write position of the log.
        expected: i64,
        /// Position the caller tried to write at.
        actual: i64,
    },

    /// Applying a transaction would make the lookup index disagree with the log.
    #[error("index divergence on stream '{stream}': {detail}")]
    IndexDivergence {
        /// Name of the stream whose index entry conflicts.
        stream: String,
        /// Human-readable description of the conflict.
        detail: String,
    },

    /// The writer or committer task is no longer running.
    #[error("service stopped: {0}")]
    ServiceStopped(&'static str),
}

/// Unrecoverable storage failure.
///
/// Returned by the writer and committer tasks. `stage` names the step that was
/// mutating durable state when `source` occurred.
#[derive(Debug, thiserror::Error)]
#[error("storage fault during {stage}: {source}")]
pub struct StorageFault {
    /// Pipeline step that failed (e.g. `"log write"`, `"index commit"`).
    pub stage: &'static str,
    /// Underlying error.
    #[source]
    pub source: Error,
}

impl StorageFault {
    /// Wrap `source` as a fault raised during `stage`.
    pub fn new(stage: &'static str, source: Error) -> Self {
        Self { stage, source }
    }
}
